//! Saga state-transition law.
//!
//! Every saga stores its progress as a value of a totally ordered state enum.
//! A handler that reacts to a message names the state it expects the saga to
//! be in and the state to move to:
//!
//! ```text
//! current < expected  ──► StateNotReached (retryable, redeliver later)
//! current == expected ──► state = next, handler performs its side effect
//! current > expected  ──► already advanced, drop the message silently
//! ```
//!
//! This makes every saga handler safe under duplicate and out-of-order
//! delivery without any extra deduplication.

use std::fmt::Debug;

use crate::error::{Result, SagaError};

/// Saga payload carrying an ordered state.
pub trait SagaData {
    /// The saga's state enum. Declaration order is progress order.
    type State: Copy + Ord + Debug;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);
}

/// Moves `data` from `expected` to `next`.
///
/// Returns `Ok(true)` if the state was advanced and the caller should perform
/// the side effect and persist the record, `Ok(false)` if the saga is already
/// past `expected`.
pub fn switch_state<D: SagaData>(data: &mut D, expected: D::State, next: D::State) -> Result<bool> {
    if !ensure_state(data, expected)? {
        return Ok(false);
    }
    data.set_state(next);
    Ok(true)
}

/// Checks that `data` is exactly in `expected` without changing it.
///
/// Same outcomes as [`switch_state`]: an error if the saga is behind,
/// `Ok(false)` if it is ahead.
pub fn ensure_state<D: SagaData>(data: &D, expected: D::State) -> Result<bool> {
    let current = data.state();
    if current < expected {
        return Err(SagaError::StateNotReached {
            expected: format!("{expected:?}"),
            actual: format!("{current:?}"),
        });
    }
    Ok(current == expected)
}

/// Records the outcome of a transition attempt for `saga`.
pub(crate) fn record_transition(saga: &'static str, advanced: bool) {
    if advanced {
        metrics::counter!("saga_transitions_total", "saga" => saga).increment(1);
    } else {
        metrics::counter!("saga_duplicates_dropped_total", "saga" => saga).increment(1);
        tracing::debug!(saga, "message already handled, dropped");
    }
}

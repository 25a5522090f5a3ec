//! Message pump: takes deliveries off the bus, dispatches them, and retries or
//! dead-letters the ones that fail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::bus::{Delivery, InMemoryMessageBus};
use crate::dispatcher::Dispatcher;

/// How failed deliveries are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries per message before it is dead-lettered. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,

    /// Pause before a failed message is put back on the queue.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Redelivered,
    DeadLettered,
}

/// Totals of a [`MessagePump::drain`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub handled: usize,
    pub redelivered: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.handled + self.redelivered + self.dead_lettered
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Handled => self.handled += 1,
            Outcome::Redelivered => self.redelivered += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

#[derive(Clone)]
pub struct MessagePump {
    dispatcher: Dispatcher,
    bus: InMemoryMessageBus,
    policy: RetryPolicy,
    /// Redeliveries waiting out their delay.
    retries: Arc<Mutex<JoinSet<()>>>,
}

impl MessagePump {
    pub fn new(dispatcher: Dispatcher, bus: InMemoryMessageBus, policy: RetryPolicy) -> Self {
        Self {
            dispatcher,
            bus,
            policy,
            retries: Arc::default(),
        }
    }

    pub fn bus(&self) -> &InMemoryMessageBus {
        &self.bus
    }

    /// Number of failed deliveries still waiting to be put back on the queue.
    pub async fn pending_retries(&self) -> usize {
        let mut retries = self.retries.lock().await;
        while retries.try_join_next().is_some() {}
        retries.len()
    }

    /// Handles one delivery. A retryable failure is put back on the queue
    /// after `delay`; anything else that fails is dead-lettered.
    #[tracing::instrument(skip(self, delivery), fields(message = delivery.message.name(), operation_id = %delivery.message.operation_id(), attempt = delivery.attempt))]
    pub async fn process(&self, delivery: Delivery, delay: Duration) -> Outcome {
        let started = Instant::now();
        let result = self.dispatcher.dispatch(&delivery.message).await;
        metrics::histogram!("message_handling_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("messages_processed_total").increment(1);
                Outcome::Handled
            }
            Err(e) if e.is_retryable() && self.policy.allows_retry(delivery.attempt) => {
                metrics::counter!("messages_redelivered_total").increment(1);
                tracing::debug!(error = %e, "message will be redelivered");
                if delay.is_zero() {
                    self.bus.redeliver(delivery).await;
                } else {
                    let bus = self.bus.clone();
                    let mut retries = self.retries.lock().await;
                    while retries.try_join_next().is_some() {}
                    retries.spawn(async move {
                        tokio::time::sleep(delay).await;
                        bus.redeliver(delivery).await;
                    });
                }
                Outcome::Redelivered
            }
            Err(e) => {
                metrics::counter!("messages_dead_lettered_total").increment(1);
                tracing::error!(error = %e, "message dead-lettered");
                self.bus.dead_letter(delivery, e.to_string()).await;
                Outcome::DeadLettered
            }
        }
    }

    /// Processes queued messages until the queue is empty. Retries go back
    /// on the queue immediately.
    pub async fn drain(&self) -> DrainReport {
        self.drain_at_most(usize::MAX).await
    }

    /// Like [`MessagePump::drain`], but stops after `limit` deliveries.
    pub async fn drain_at_most(&self, limit: usize) -> DrainReport {
        let mut report = DrainReport::default();
        while report.total() < limit {
            let Some(delivery) = self.bus.try_receive().await else {
                break;
            };
            report.record(self.process(delivery, Duration::ZERO).await);
        }
        report
    }

    /// Runs `workers` concurrent consumers until `shutdown` turns true.
    ///
    /// Returns once every worker has stopped and every delayed redelivery is
    /// back on the queue.
    pub async fn run(self, workers: usize, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker in 0..workers.max(1) {
            let pump = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!(worker, "message worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        delivery = pump.bus.receive() => {
                            pump.process(delivery, pump.policy.delay).await;
                        }
                    }
                }
                tracing::info!(worker, "message worker stopped");
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "message worker panicked");
            }
        }

        let mut retries = self.retries.lock().await;
        if !retries.is_empty() {
            tracing::info!(waiting = retries.len(), "waiting for delayed redeliveries");
        }
        while let Some(result) = retries.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "delayed redelivery failed");
            }
        }
    }
}

//! Message bus contract and the in-process bus.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::messages::{Command, Event, Message};

/// At-least-once delivery of commands and events.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Sends a command to its single handler.
    async fn send(&self, command: Command) -> Result<()>;

    /// Publishes an event to all subscribers.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// A message handed to a worker, with the number of times it was delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub attempt: u32,
}

/// A message that was given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message: Message,
    pub attempts: u32,
    pub error: String,
}

#[derive(Default)]
struct BusState {
    queue: VecDeque<Delivery>,
    history: Vec<Message>,
    published: Vec<Event>,
    dead_letters: Vec<DeadLetter>,
}

/// In-process bus backed by a FIFO queue.
///
/// Commands and events share one queue; the dispatcher routes each to its
/// handlers. Everything ever sent is also kept in `history` so a test can
/// replay a whole run.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl InMemoryMessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for its first delivery.
    pub async fn enqueue(&self, message: Message) {
        {
            let mut state = self.state.lock().await;
            if let Message::Event(ref event) = message {
                state.published.push(event.clone());
            }
            state.history.push(message.clone());
            state.queue.push_back(Delivery {
                message,
                attempt: 1,
            });
        }
        self.notify.notify_one();
    }

    /// Puts a failed delivery back at the end of the queue.
    pub async fn redeliver(&self, delivery: Delivery) {
        self.state.lock().await.queue.push_back(Delivery {
            message: delivery.message,
            attempt: delivery.attempt + 1,
        });
        self.notify.notify_one();
    }

    /// Records a message that will not be delivered again.
    pub async fn dead_letter(&self, delivery: Delivery, error: String) {
        self.state.lock().await.dead_letters.push(DeadLetter {
            message: delivery.message,
            attempts: delivery.attempt,
            error,
        });
    }

    /// Takes the next message if one is queued.
    pub async fn try_receive(&self) -> Option<Delivery> {
        self.state.lock().await.queue.pop_front()
    }

    /// Waits for the next message.
    pub async fn receive(&self) -> Delivery {
        loop {
            if let Some(delivery) = self.try_receive().await {
                return delivery;
            }
            self.notify.notified().await;
        }
    }

    /// Number of queued deliveries.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Every event published so far, in publication order.
    pub async fn published_events(&self) -> Vec<Event> {
        self.state.lock().await.published.clone()
    }

    /// Every message ever enqueued, excluding redeliveries.
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.history.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, command: Command) -> Result<()> {
        tracing::debug!(command = command.name(), operation_id = %command.operation_id(), "command sent");
        self.enqueue(Message::Command(command)).await;
        Ok(())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        tracing::debug!(event = event.name(), operation_id = %event.operation_id(), "event published");
        self.enqueue(Message::Event(event)).await;
        Ok(())
    }
}

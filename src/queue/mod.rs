//! Durable work queue: three named queues (main, retry, dead-letter), manual
//! acknowledgement, prefetch of one message per consumer.

mod client;
mod memory;
mod postgres;

pub use client::{HandlerError, MessageHandler, ProcessOutcome, QueueClient, QueueStats};
pub use memory::MemoryBroker;
pub use postgres::PgBroker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

pub const PROCESS_EVENTS: &str = "PROCESS_EVENTS";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue store error: {0}")]
    Db(#[from] DbError),

    #[error("Invalid message payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// One block range to process, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    pub start_block: u64,
    /// Inclusive
    pub end_block: u64,
    pub task_code: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WorkUnit {
    pub fn new(start_block: u64, end_block: u64, task_code: impl Into<String>) -> Self {
        Self {
            start_block,
            end_block,
            task_code: task_code.into(),
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.end_block.saturating_sub(self.start_block) + 1
    }

    /// The copy published to the retry queue after a failed attempt.
    pub fn next_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub retry: String,
    pub dead_letter: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            main: "ethereum.blocks.queue".to_string(),
            retry: "ethereum.blocks.retry.queue".to_string(),
            dead_letter: "ethereum.blocks.deadletter.queue".to_string(),
        }
    }
}

/// A claimed message. It stays invisible to other consumers until it is
/// acknowledged or rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: i64,
    pub queue: String,
    pub unit: WorkUnit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Redelivery {
    pub redelivered: u64,
    pub dead_lettered: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Durable publish; the message becomes visible after `delay`.
    async fn publish(&self, queue: &str, unit: &WorkUnit, delay: Duration) -> Result<(), QueueError>;

    /// Claims the oldest visible message in `queue` for `consumer`.
    async fn fetch(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    /// Removes a processed message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Removes a failed message without requeueing it.
    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Moves visible retry-queue messages back to main, or to the dead-letter
    /// queue once their `retryCount` exceeds `max_retries`.
    async fn redeliver_due(&self, names: &QueueNames, max_retries: u32) -> Result<Redelivery, QueueError>;

    /// Makes messages claimed longer than `older_than` ago visible again.
    async fn recover_unacked(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Visible and claimed messages in `queue`.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn purge(&self, queue: &str) -> Result<u64, QueueError>;
}

//! Splits a block span into work units and publishes them.

use thiserror::Error;

use crate::queue::{QueueClient, QueueError, WorkUnit, PROCESS_EVENTS};

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("Invalid block range: start={start} must be below end={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Blocks per message must be positive")]
    InvalidUnitSize,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Inclusive `(start, end)` pairs covering `[start, end)` in `unit_size` steps,
/// produced lazily. The last pair is shortened to end at `end - 1`.
#[derive(Debug, Clone)]
pub struct RangePlan {
    next: u64,
    end: u64,
    unit_size: u64,
}

impl RangePlan {
    /// Number of units the whole plan yields.
    pub fn unit_count(&self) -> u64 {
        self.end.saturating_sub(self.next).div_ceil(self.unit_size)
    }
}

impl Iterator for RangePlan {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let from = self.next;
        let last = from.saturating_add(self.unit_size).min(self.end) - 1;
        self.next = last + 1;
        Some((from, last))
    }
}

pub fn plan_ranges(start: u64, end: u64, unit_size: u64) -> Result<RangePlan, ProduceError> {
    if start >= end {
        return Err(ProduceError::InvalidRange { start, end });
    }
    if unit_size == 0 {
        return Err(ProduceError::InvalidUnitSize);
    }
    Ok(RangePlan {
        next: start,
        end,
        unit_size,
    })
}

#[derive(Debug, Clone)]
pub struct BlockProducer {
    queue: QueueClient,
}

impl BlockProducer {
    pub fn new(queue: QueueClient) -> Self {
        Self { queue }
    }

    /// Publishes one `PROCESS_EVENTS` unit per planned range. Running it twice
    /// publishes the span twice.
    pub async fn produce_range(&self, start: u64, end: u64, unit_size: u64) -> Result<u64, ProduceError> {
        let ranges = plan_ranges(start, end, unit_size)?;
        let total = ranges.unit_count();
        tracing::info!(
            "Producing {} messages for blocks {}..{} ({} blocks per message)",
            total,
            start,
            end,
            unit_size
        );

        let mut sent = 0u64;
        for (from, to) in ranges {
            self.queue.publish(&WorkUnit::new(from, to, PROCESS_EVENTS)).await?;
            sent += 1;
            if sent % 100 == 0 {
                tracing::info!(
                    "Sent {}/{} messages ({}%)",
                    sent,
                    total,
                    sent as u128 * 100 / total as u128
                );
            }
        }

        tracing::info!("All {} messages published to {}", sent, self.queue.names().main);
        Ok(sent)
    }

    /// Publishes a single unit for the inclusive range `[start, end]`.
    pub async fn produce_one(&self, start: u64, end: u64, task_code: &str) -> Result<(), ProduceError> {
        if start > end {
            return Err(ProduceError::InvalidRange { start, end });
        }
        self.queue.publish(&WorkUnit::new(start, end, task_code)).await?;
        tracing::info!("Published blocks {}-{} ({})", start, end, task_code);
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Broker, QueueError, QueueNames, WorkUnit};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivered work unit. An `Err` sends the unit down the retry
/// path; `Ok` acknowledges it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, unit: WorkUnit) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acked(WorkUnit),
    /// The handler failed; a copy with this `retryCount` went to the retry queue.
    Retried { unit: WorkUnit, retry_count: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub main: u64,
    pub retry: u64,
    pub dead_letter: u64,
}

#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    names: QueueNames,
    retry_delay: Duration,
    max_retries: u32,
    poll_interval: Duration,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>, names: QueueNames) -> Self {
        Self {
            broker,
            names,
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publishes to the main queue.
    pub async fn publish(&self, unit: &WorkUnit) -> Result<(), QueueError> {
        self.broker.publish(&self.names.main, unit, Duration::ZERO).await
    }

    /// Runs one delivery through `handler`. Returns `None` when the main queue
    /// has nothing visible.
    pub async fn process_next(
        &self,
        consumer: &str,
        handler: &dyn MessageHandler,
    ) -> Result<Option<ProcessOutcome>, QueueError> {
        let moved = self.broker.redeliver_due(&self.names, self.max_retries).await?;
        if moved.redelivered > 0 {
            tracing::debug!("{} retried units back on {}", moved.redelivered, self.names.main);
        }

        let Some(delivery) = self.broker.fetch(&self.names.main, consumer).await? else {
            return Ok(None);
        };
        let unit = delivery.unit.clone();
        tracing::debug!(
            "{} received blocks {}-{} (retry {})",
            consumer,
            unit.start_block,
            unit.end_block,
            unit.retry_count
        );

        match handler.handle(unit.clone()).await {
            Ok(()) => {
                self.broker.ack(&delivery).await?;
                Ok(Some(ProcessOutcome::Acked(unit)))
            }
            Err(e) => {
                let retry = unit.next_retry();
                tracing::warn!(
                    "Blocks {}-{} failed on {}: {}; requeueing with retryCount {}",
                    unit.start_block,
                    unit.end_block,
                    consumer,
                    e,
                    retry.retry_count
                );
                // Publish the copy first so a crash in between duplicates the
                // unit rather than losing it.
                self.broker
                    .publish(&self.names.retry, &retry, self.retry_delay)
                    .await?;
                self.broker.reject(&delivery).await?;
                Ok(Some(ProcessOutcome::Retried {
                    unit,
                    retry_count: retry.retry_count,
                }))
            }
        }
    }

    /// Delivers messages one at a time until `shutdown` flips to `true`.
    /// Returns the number of deliveries handled.
    pub async fn subscribe(
        &self,
        consumer: &str,
        handler: &dyn MessageHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, QueueError> {
        tracing::info!("{} consuming from {}", consumer, self.names.main);
        let mut handled = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next(consumer, handler).await {
                Ok(Some(_)) => {
                    handled += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("{} queue error: {}", consumer, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("{} stopped after {} deliveries", consumer, handled);
        Ok(handled)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            main: self.broker.depth(&self.names.main).await?,
            retry: self.broker.depth(&self.names.retry).await?,
            dead_letter: self.broker.depth(&self.names.dead_letter).await?,
        })
    }

    pub async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let removed = self.broker.purge(queue).await?;
        tracing::info!("Purged {} messages from {}", removed, queue);
        Ok(removed)
    }

    /// Moves every dead-lettered unit back to main with `retryCount` reset.
    pub async fn requeue_dead_letters(&self, operator: &str) -> Result<u64, QueueError> {
        let mut moved = 0;
        while let Some(delivery) = self.broker.fetch(&self.names.dead_letter, operator).await? {
            let mut unit = delivery.unit.clone();
            unit.retry_count = 0;
            self.publish(&unit).await?;
            self.broker.ack(&delivery).await?;
            moved += 1;
        }
        tracing::info!("Requeued {} dead-lettered units to {}", moved, self.names.main);
        Ok(moved)
    }

    /// Makes deliveries claimed by crashed consumers visible again.
    pub async fn recover_unacked(&self, older_than: Duration) -> Result<u64, QueueError> {
        let recovered = self.broker.recover_unacked(older_than).await?;
        if recovered > 0 {
            tracing::warn!("Recovered {} unacknowledged deliveries", recovered);
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("names", &self.names)
            .field("retry_delay", &self.retry_delay)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, PROCESS_EVENTS};
    use std::sync::Mutex;

    /// Fails the first `failures` deliveries and records every retryCount seen.
    struct FlakyHandler {
        failures: Mutex<u32>,
        seen: Mutex<Vec<u32>>,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, unit: WorkUnit) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(unit.retry_count);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err("boom".into());
            }
            Ok(())
        }
    }

    fn client(broker: Arc<MemoryBroker>) -> QueueClient {
        QueueClient::new(broker, QueueNames::default())
            .with_retry_delay(Duration::from_secs(5))
            .with_max_retries(3)
    }

    #[test]
    fn test_work_unit_wire_format() {
        let json = r#"{"startBlock":100,"endBlock":109,"taskCode":"PROCESS_EVENTS","createdAt":"2024-01-01T00:00:00Z"}"#;
        let unit: WorkUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.retry_count, 0);
        assert_eq!(unit.block_count(), 10);

        let encoded = serde_json::to_value(unit.next_retry()).unwrap();
        assert_eq!(encoded["retryCount"], 1);
        assert_eq!(encoded["startBlock"], 100);
        assert_eq!(encoded["taskCode"], PROCESS_EVENTS);
    }

    #[tokio::test]
    async fn test_success_acks_message() {
        let broker = Arc::new(MemoryBroker::new());
        let client = client(broker.clone());
        client.publish(&WorkUnit::new(100, 109, PROCESS_EVENTS)).await.unwrap();

        let handler = FlakyHandler::new(0);
        let outcome = client.process_next("c", &handler).await.unwrap();
        assert!(matches!(outcome, Some(ProcessOutcome::Acked(_))));
        assert_eq!(client.stats().await.unwrap(), QueueStats::default());
        assert!(client.process_next("c", &handler).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_goes_through_retry_queue_after_delay() {
        let broker = Arc::new(MemoryBroker::new());
        let client = client(broker.clone());
        client.publish(&WorkUnit::new(100, 109, PROCESS_EVENTS)).await.unwrap();
        let handler = FlakyHandler::new(1);

        let outcome = client.process_next("c", &handler).await.unwrap();
        assert!(matches!(outcome, Some(ProcessOutcome::Retried { retry_count: 1, .. })));
        assert_eq!(
            client.stats().await.unwrap(),
            QueueStats {
                main: 0,
                retry: 1,
                dead_letter: 0
            }
        );

        // Not redelivered before the delay elapses.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(client.process_next("c", &handler).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let outcome = client.process_next("c", &handler).await.unwrap();
        assert!(matches!(outcome, Some(ProcessOutcome::Acked(_))));
        assert_eq!(handler.seen(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisoned_unit_lands_in_dead_letter() {
        let broker = Arc::new(MemoryBroker::new());
        let client = client(broker.clone());
        client.publish(&WorkUnit::new(100, 109, PROCESS_EVENTS)).await.unwrap();
        let handler = FlakyHandler::new(u32::MAX);

        for _ in 0..10 {
            client.process_next("c", &handler).await.unwrap();
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        client.process_next("c", &handler).await.unwrap();

        assert_eq!(handler.seen(), vec![0, 1, 2, 3]);
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.main + stats.retry, 0);
        assert_eq!(broker.peek(&client.names().dead_letter)[0].retry_count, 4);

        let moved = client.requeue_dead_letters("operator").await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(broker.peek(&client.names().main)[0].retry_count, 0);
        assert_eq!(client.stats().await.unwrap().dead_letter, 0);
    }

    #[tokio::test]
    async fn test_purge_empties_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let client = client(broker);
        for i in 0..3 {
            client
                .publish(&WorkUnit::new(i * 10, i * 10 + 9, PROCESS_EVENTS))
                .await
                .unwrap();
        }
        let main = client.names().main.clone();
        assert_eq!(client.purge(&main).await.unwrap(), 3);
        assert_eq!(client.stats().await.unwrap().main, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let client = client(broker);
        for i in 0..2 {
            client
                .publish(&WorkUnit::new(i * 10, i * 10 + 9, PROCESS_EVENTS))
                .await
                .unwrap();
        }
        let handler = Arc::new(FlakyHandler::new(0));
        let (tx, rx) = watch::channel(false);

        let task = {
            let client = client.clone();
            let handler = handler.clone();
            tokio::spawn(async move { client.subscribe("c", handler.as_ref(), rx).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();

        let handled = task.await.unwrap().unwrap();
        assert_eq!(handled, 2);
        assert_eq!(handler.seen(), vec![0, 0]);
    }
}

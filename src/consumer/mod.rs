//! Per-unit processing: lease an endpoint, fetch, decode, persist, record the
//! attempt, release.

pub mod decode;

pub use decode::{decode_log, extract_parameters};

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::endpoints::{Endpoint, EndpointPool, PoolError};
use crate::events::EventStore;
use crate::metrics::{MetricsRecorder, NewRun};
use crate::queue::{HandlerError, MessageHandler, QueueClient, QueueError, WorkUnit};
use crate::rpc::{LogSourceFactory, RpcError};
use crate::signatures::SignatureCache;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("No endpoint available after {attempts} attempts")]
    NoEndpointAvailable { attempts: u32 },

    #[error("Endpoint {url} failed liveness probe: {source}")]
    EndpointConnectivity {
        url: String,
        #[source]
        source: RpcError,
    },

    #[error("Fetching logs for blocks {start}-{end} failed: {source}")]
    UpstreamFetch {
        start: u64,
        end: u64,
        #[source]
        source: RpcError,
    },

    #[error("Persisting {events} events failed: {source}")]
    BatchPersist {
        events: usize,
        #[source]
        source: StoreError,
    },

    #[error("Recording processing run failed: {0}")]
    Metrics(#[source] StoreError),

    #[error("Endpoint pool error: {0}")]
    Pool(#[source] PoolError),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_endpoint_attempts: u32,
    pub endpoint_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_endpoint_attempts: 10,
            endpoint_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of one successful unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub endpoint_id: i64,
    pub blocks: u64,
    pub logs: usize,
    pub events: usize,
    pub endpoint_height: u64,
}

pub struct BlockConsumer {
    id: String,
    config: ConsumerConfig,
    pool: EndpointPool,
    sources: Arc<dyn LogSourceFactory>,
    signatures: Arc<SignatureCache>,
    events: Arc<dyn EventStore>,
    metrics: MetricsRecorder,
}

impl BlockConsumer {
    pub fn new(
        config: ConsumerConfig,
        pool: EndpointPool,
        sources: Arc<dyn LogSourceFactory>,
        signatures: Arc<SignatureCache>,
        events: Arc<dyn EventStore>,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            id: format!("consumer-{}", uuid::Uuid::new_v4()),
            config,
            pool,
            sources,
            signatures,
            events,
            metrics,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribes to the main queue until `shutdown` flips to `true`.
    pub async fn run(&self, queue: &QueueClient, shutdown: watch::Receiver<bool>) -> Result<u64, QueueError> {
        queue.subscribe(&self.id, self, shutdown).await
    }

    /// Processes one unit end to end. The leased endpoint is released on every
    /// path, and once a run is opened it is finalized before this returns.
    pub async fn process(&self, unit: &WorkUnit) -> Result<UnitReport, ConsumerError> {
        let lease = match self
            .pool
            .acquire_with_retry(
                &self.id,
                self.config.max_endpoint_attempts,
                self.config.endpoint_backoff,
            )
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::NoEndpointAvailable) => {
                tracing::error!(
                    "{} found no endpoint for blocks {}-{}",
                    self.id,
                    unit.start_block,
                    unit.end_block
                );
                return Err(ConsumerError::NoEndpointAvailable {
                    attempts: self.config.max_endpoint_attempts,
                });
            }
            Err(e) => return Err(ConsumerError::Pool(e)),
        };
        tracing::info!(
            "{} processing blocks {}-{} on {} (retry {})",
            self.id,
            unit.start_block,
            unit.end_block,
            lease.endpoint().name,
            unit.retry_count
        );

        let result = self.process_leased(unit, lease.endpoint()).await;

        let endpoint_id = lease.id();
        if let Err(e) = lease.release().await {
            tracing::error!("{} failed to release endpoint {}: {}", self.id, endpoint_id, e);
        }
        result
    }

    async fn process_leased(&self, unit: &WorkUnit, endpoint: &Endpoint) -> Result<UnitReport, ConsumerError> {
        let started = Instant::now();
        let run_id = self
            .metrics
            .start(NewRun {
                consumer_id: self.id.clone(),
                endpoint_id: endpoint.id,
                endpoint_url: endpoint.url.clone(),
                start_block: unit.start_block,
                end_block: unit.end_block,
                retry_count: unit.retry_count,
            })
            .await
            .map_err(ConsumerError::Metrics)?;

        let result = self.run_pipeline(unit, endpoint).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let finalized = match &result {
            Ok(report) => {
                tracing::info!(
                    "{} completed blocks {}-{}: {} events in {}ms",
                    self.id,
                    unit.start_block,
                    unit.end_block,
                    report.events,
                    elapsed_ms
                );
                self.metrics
                    .complete(run_id, report.blocks, report.events as u64, elapsed_ms)
                    .await
            }
            Err(e) => {
                tracing::error!(
                    "{} failed blocks {}-{}: {}",
                    self.id,
                    unit.start_block,
                    unit.end_block,
                    e
                );
                self.metrics
                    .fail(run_id, e.to_string(), Some(error_chain(e)), elapsed_ms)
                    .await
            }
        };
        if let Err(e) = finalized {
            // Events are already committed; failing the unit here would only
            // re-insert them on redelivery.
            tracing::error!("{} could not finalize run {}: {}", self.id, run_id, e);
        }
        result
    }

    async fn run_pipeline(&self, unit: &WorkUnit, endpoint: &Endpoint) -> Result<UnitReport, ConsumerError> {
        let connectivity = |source: RpcError| ConsumerError::EndpointConnectivity {
            url: endpoint.url.clone(),
            source,
        };

        let source = self.sources.connect(&endpoint.url).map_err(connectivity)?;
        let height = match source.current_height().await {
            Ok(height) => {
                self.record_health(endpoint.id, Some(height), None).await;
                height
            }
            Err(e) => {
                self.record_health(endpoint.id, None, Some(&e.to_string())).await;
                return Err(connectivity(e));
            }
        };

        let logs = source
            .get_logs(unit.start_block, unit.end_block)
            .await
            .map_err(|source| ConsumerError::UpstreamFetch {
                start: unit.start_block,
                end: unit.end_block,
                source,
            })?;
        tracing::debug!("{} fetched {} logs", self.id, logs.len());

        let signatures: Vec<String> = logs.iter().map(|log| log.signature().to_string()).collect();
        let names: HashMap<String, Option<String>> = self.signatures.resolve_many(&signatures).await;
        let events: Vec<_> = logs
            .iter()
            .map(|log| decode_log(log, names.get(log.signature()).cloned().flatten()))
            .collect();

        self.events
            .insert_batch(&events)
            .await
            .map_err(|source| ConsumerError::BatchPersist {
                events: events.len(),
                source,
            })?;

        Ok(UnitReport {
            endpoint_id: endpoint.id,
            blocks: unit.block_count(),
            logs: logs.len(),
            events: events.len(),
            endpoint_height: height,
        })
    }

    async fn record_health(&self, endpoint_id: i64, height: Option<u64>, error: Option<&str>) {
        if let Err(e) = self.pool.record_health(endpoint_id, height, error).await {
            tracing::warn!("Failed to record health of endpoint {}: {}", endpoint_id, e);
        }
    }
}

#[async_trait]
impl MessageHandler for BlockConsumer {
    async fn handle(&self, unit: WorkUnit) -> Result<(), HandlerError> {
        self.process(&unit).await.map(|_| ()).map_err(|e| Box::new(e) as HandlerError)
    }
}

impl std::fmt::Debug for BlockConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockConsumer")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The error and its sources, outermost first, one per line.
fn error_chain(error: &dyn StdError) -> String {
    let mut lines = vec![error.to_string()];
    let mut current = error.source();
    while let Some(source) = current {
        lines.push(format!("caused by: {}", source));
        current = source.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{EndpointStore, NewEndpoint};
    use crate::metrics::{RunStatus, RunStore};
    use crate::producer::BlockProducer;
    use crate::queue::{MemoryBroker, ProcessOutcome, QueueNames};
    use crate::rpc::{LogSource, RawLog};
    use crate::signatures::{LookupError, SignatureLookup};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    struct CountingLookup {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SignatureLookup for CountingLookup {
        async fn lookup(&self, _hex_signature: &str) -> Result<String, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("Transfer(address,address,uint256)".to_string())
        }

        fn source(&self) -> &str {
            "counting"
        }
    }

    /// Two logs per block in the requested range.
    struct ScriptedSource {
        height: Result<u64, ()>,
        fail_logs: bool,
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        async fn current_height(&self) -> Result<u64, RpcError> {
            self.height
                .map_err(|_| RpcError::Transport("connection refused".to_string()))
        }

        async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, RpcError> {
            if self.fail_logs {
                return Err(RpcError::ProviderError("query returned more than 10000 results".to_string()));
            }
            let mut logs = Vec::new();
            for block in from_block..=to_block {
                for log_index in 0..2 {
                    logs.push(RawLog {
                        block_hash: format!("0x{:064x}", block),
                        block_number: block,
                        transaction_hash: format!("0x{:064x}", block * 10 + log_index),
                        transaction_index: 0,
                        log_index,
                        address: "0x00000000000000000000000000000000000000aa".to_string(),
                        topics: vec![TRANSFER.to_string(), format!("0x{:064x}", 1)],
                        data: format!("0x{:064x}", 1000 + block),
                        block_timestamp: None,
                    });
                }
            }
            Ok(logs)
        }
    }

    struct ScriptedFactory {
        height: Result<u64, ()>,
        fail_logs: bool,
        connects: AtomicU32,
    }

    impl LogSourceFactory for ScriptedFactory {
        fn connect(&self, _url: &str) -> Result<Box<dyn LogSource>, RpcError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                height: self.height,
                fail_logs: self.fail_logs,
            }))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        lookup: Arc<CountingLookup>,
        consumer: BlockConsumer,
    }

    async fn harness(endpoints: usize, height: Result<u64, ()>, fail_logs: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for i in 0..endpoints {
            store
                .upsert(&NewEndpoint {
                    name: format!("node-{}", i),
                    url: format!("http://node-{}:8545", i),
                    active: true,
                    last_known_block: None,
                    last_error: None,
                })
                .await
                .unwrap();
        }
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
        });
        let signatures = Arc::new(SignatureCache::new(store.clone(), lookup.clone()));
        let consumer = BlockConsumer::new(
            ConsumerConfig {
                max_endpoint_attempts: 3,
                endpoint_backoff: Duration::from_secs(2),
            },
            EndpointPool::new(store.clone()),
            Arc::new(ScriptedFactory {
                height,
                fail_logs,
                connects: AtomicU32::new(0),
            }),
            signatures,
            store.clone(),
            MetricsRecorder::new(store.clone()),
        )
        .with_id("consumer-test");
        Harness {
            store,
            lookup,
            consumer,
        }
    }

    fn queue(broker: Arc<MemoryBroker>) -> QueueClient {
        QueueClient::new(broker, QueueNames::default())
            .with_retry_delay(Duration::from_secs(5))
            .with_max_retries(3)
    }

    #[tokio::test]
    async fn test_end_to_end_three_units() {
        let h = harness(1, Ok(20_000_000), false).await;
        let broker = Arc::new(MemoryBroker::new());
        let queue = queue(broker);
        BlockProducer::new(queue.clone())
            .produce_range(100, 125, 10)
            .await
            .unwrap();

        let mut acked = Vec::new();
        while let Some(outcome) = queue.process_next(h.consumer.id(), &h.consumer).await.unwrap() {
            match outcome {
                ProcessOutcome::Acked(unit) => acked.push((unit.start_block, unit.end_block)),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(acked, vec![(100, 109), (110, 119), (120, 124)]);

        let runs = h.store.runs();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
        assert_eq!(runs[2].blocks_processed, 5);
        assert_eq!(runs[2].events_extracted, 10);
        assert!(runs.iter().all(|r| r.blocks_per_second.is_some()));

        assert_eq!(h.store.leases_granted(), 3);
        assert_eq!(h.store.leases_released(), 3);
        assert!(h.store.eligible().await.unwrap().len() == 1);

        let events = h.store.events();
        assert_eq!(events.len(), 50);
        assert!(events.iter().all(|e| e.event_name.as_deref() == Some("Transfer")));
        assert_eq!(events[0].params.len(), 2);
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 1);

        let endpoint = &h.store.list().await.unwrap()[0];
        assert_eq!(endpoint.last_known_block, Some(20_000_000));
        assert!(endpoint.last_health_check_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_fails_twice_then_succeeds() {
        let h = harness(1, Ok(20_000_000), false).await;
        let broker = Arc::new(MemoryBroker::new());
        let queue = queue(broker);
        queue
            .publish(&WorkUnit::new(100, 109, crate::queue::PROCESS_EVENTS))
            .await
            .unwrap();
        h.store.fail_next_batches(2);

        let first = queue.process_next(h.consumer.id(), &h.consumer).await.unwrap();
        assert!(matches!(first, Some(ProcessOutcome::Retried { retry_count: 1, .. })));
        assert!(queue.process_next(h.consumer.id(), &h.consumer).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = queue.process_next(h.consumer.id(), &h.consumer).await.unwrap();
        assert!(matches!(second, Some(ProcessOutcome::Retried { retry_count: 2, .. })));

        tokio::time::advance(Duration::from_secs(5)).await;
        let third = queue.process_next(h.consumer.id(), &h.consumer).await.unwrap();
        assert!(matches!(third, Some(ProcessOutcome::Acked(_))));
        assert_eq!(queue.stats().await.unwrap(), crate::queue::QueueStats::default());

        let runs = h.store.runs_for_range(100, 109).await.unwrap();
        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RunStatus::Failed, RunStatus::Failed, RunStatus::Completed]
        );
        let retries: Vec<u32> = runs.iter().map(|r| r.retry_count).collect();
        assert_eq!(retries, vec![0, 1, 2]);
        assert!(runs[0]
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("Persisting 20 events failed")));
        assert_eq!(h.store.events().len(), 20);
        assert_eq!(h.store.leases_granted(), h.store.leases_released());
    }

    #[tokio::test]
    async fn test_connectivity_failure_fails_run_and_releases() {
        let h = harness(1, Err(()), false).await;
        let err = h
            .consumer
            .process(&WorkUnit::new(100, 109, crate::queue::PROCESS_EVENTS))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::EndpointConnectivity { .. }));

        let runs = h.store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0]
            .stack_trace
            .as_deref()
            .is_some_and(|t| t.contains("caused by: RPC transport error")));

        let endpoint = &h.store.list().await.unwrap()[0];
        assert!(!endpoint.in_use);
        assert!(endpoint.active, "connectivity failures do not deactivate");
        assert!(endpoint.last_error.is_some());
    }

    #[tokio::test]
    async fn test_upstream_fetch_failure_persists_nothing() {
        let h = harness(1, Ok(1), true).await;
        let err = h
            .consumer
            .process(&WorkUnit::new(100, 109, crate::queue::PROCESS_EVENTS))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::UpstreamFetch { start: 100, end: 109, .. }));
        assert!(h.store.events().is_empty());
        assert_eq!(h.store.runs()[0].status, RunStatus::Failed);
        assert_eq!(h.store.leases_released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_endpoint_fails_without_run() {
        let h = harness(0, Ok(1), false).await;
        let err = h
            .consumer
            .process(&WorkUnit::new(100, 109, crate::queue::PROCESS_EVENTS))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::NoEndpointAvailable { attempts: 3 }));
        assert!(h.store.runs().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_identities_are_unique() {
        let base = harness(0, Ok(1), false).await.consumer;
        let fresh = || {
            BlockConsumer::new(
                ConsumerConfig::default(),
                base.pool.clone(),
                base.sources.clone(),
                base.signatures.clone(),
                base.events.clone(),
                base.metrics.clone(),
            )
        };
        let (a, b) = (fresh(), fresh());
        assert!(a.id().starts_with("consumer-"));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_subscribe_processes_until_shutdown() {
        let h = harness(2, Ok(5_000), false).await;
        let broker = Arc::new(MemoryBroker::new());
        let queue = queue(broker).with_poll_interval(Duration::from_millis(10));
        BlockProducer::new(queue.clone()).produce_range(0, 40, 10).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let consumer = Arc::new(h.consumer);
        let worker = {
            let consumer = consumer.clone();
            let queue = queue.clone();
            tokio::spawn(async move { consumer.run(&queue, rx).await })
        };
        while h.store.runs().iter().filter(|r| r.status == RunStatus::Completed).count() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        assert_eq!(worker.await.unwrap().unwrap(), 4);
        assert_eq!(h.store.events().len(), 80);
        assert_eq!(h.store.leases_granted(), 4);
        assert_eq!(h.store.leases_released(), 4);
    }
}

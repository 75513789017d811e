//! Per-attempt processing records and their aggregate read surface.
//!
//! Every attempt at a work unit opens exactly one [`ProcessingRun`] in
//! `processing` and moves it once to `completed` or `failed`. Finalizing an
//! already-terminal run is a no-op in every store.

mod postgres;

pub use postgres::PgRunStore;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "retrying" => Ok(RunStatus::Retrying),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRun {
    pub id: i64,
    pub consumer_id: String,
    pub endpoint_id: Option<i64>,
    pub endpoint_url: Option<String>,
    pub status: RunStatus,
    pub blocks_processed: u64,
    pub events_extracted: u64,
    pub errors_count: u64,
    pub retry_count: u32,
    pub start_block: u64,
    pub end_block: u64,
    pub execution_time_ms: Option<u64>,
    pub blocks_per_second: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

/// Values known when an attempt starts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub consumer_id: String,
    pub endpoint_id: i64,
    pub endpoint_url: String,
    pub start_block: u64,
    pub end_block: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub blocks_processed: u64,
    pub events_extracted: u64,
    pub execution_time_ms: u64,
    pub blocks_per_second: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub execution_time_ms: u64,
    pub errors_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStats {
    pub completed: u64,
    pub failed: u64,
    pub processing: u64,
    pub total_blocks: u64,
    pub total_events: u64,
    pub avg_execution_time_ms: Option<f64>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a run in `processing` and returns its id.
    async fn open_run(&self, run: &NewRun) -> Result<i64, StoreError>;

    /// Returns `false` when the run was not in `processing`.
    async fn complete_run(&self, id: i64, completion: &RunCompletion) -> Result<bool, StoreError>;

    /// Returns `false` when the run was not in `processing`.
    async fn fail_run(&self, id: i64, failure: &RunFailure) -> Result<bool, StoreError>;

    /// Fails every `processing` run bound to `endpoint_id`, restricted to
    /// `consumer_id` when given.
    async fn fail_open_runs(
        &self,
        endpoint_id: i64,
        consumer_id: Option<&str>,
        message: &str,
    ) -> Result<u64, StoreError>;

    async fn get_run(&self, id: i64) -> Result<Option<ProcessingRun>, StoreError>;

    /// Runs covering exactly `[start_block, end_block]`, oldest first.
    async fn runs_for_range(&self, start_block: u64, end_block: u64) -> Result<Vec<ProcessingRun>, StoreError>;

    async fn active_runs(&self) -> Result<Vec<ProcessingRun>, StoreError>;

    async fn global_stats(&self) -> Result<GlobalStats, StoreError>;
}

/// `blocks / seconds`, with sub-millisecond runs counted as one millisecond.
pub fn blocks_per_second(blocks: u64, execution_time_ms: u64) -> f64 {
    blocks as f64 / (execution_time_ms.max(1) as f64 / 1000.0)
}

/// Write surface the consumer uses to make every attempt observable.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn RunStore>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn start(&self, run: NewRun) -> Result<i64, StoreError> {
        let id = self.store.open_run(&run).await?;
        tracing::debug!(
            "Run {} opened by {} for blocks {}-{} (retry {})",
            id,
            run.consumer_id,
            run.start_block,
            run.end_block,
            run.retry_count
        );
        Ok(id)
    }

    pub async fn complete(
        &self,
        id: i64,
        blocks_processed: u64,
        events_extracted: u64,
        execution_time_ms: u64,
    ) -> Result<bool, StoreError> {
        let completion = RunCompletion {
            blocks_processed,
            events_extracted,
            execution_time_ms,
            blocks_per_second: blocks_per_second(blocks_processed, execution_time_ms),
        };
        let applied = self.store.complete_run(id, &completion).await?;
        if !applied {
            self.warn_ignored(id, "completion").await;
        }
        Ok(applied)
    }

    pub async fn fail(
        &self,
        id: i64,
        error_message: String,
        stack_trace: Option<String>,
        execution_time_ms: u64,
    ) -> Result<bool, StoreError> {
        let failure = RunFailure {
            error_message,
            stack_trace,
            execution_time_ms,
            errors_count: 1,
        };
        let applied = self.store.fail_run(id, &failure).await?;
        if !applied {
            self.warn_ignored(id, "failure").await;
        }
        Ok(applied)
    }

    async fn warn_ignored(&self, id: i64, action: &str) {
        match self.store.get_run(id).await {
            Ok(Some(run)) if run.status.is_terminal() => {
                tracing::warn!("Run {} was already {}; {} ignored", id, run.status, action)
            }
            Ok(Some(run)) => {
                tracing::warn!("Run {} is {}, not processing; {} ignored", id, run.status, action)
            }
            Ok(None) => tracing::warn!("Run {} does not exist; {} ignored", id, action),
            Err(e) => tracing::warn!("Run {} {} ignored and could not be read back: {}", id, action, e),
        }
    }

    pub async fn active_runs(&self) -> Result<Vec<ProcessingRun>, StoreError> {
        self.store.active_runs().await
    }

    pub async fn global_stats(&self) -> Result<GlobalStats, StoreError> {
        self.store.global_stats().await
    }
}

impl fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

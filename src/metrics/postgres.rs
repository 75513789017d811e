use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_postgres::Row;

use super::{GlobalStats, NewRun, ProcessingRun, RunCompletion, RunFailure, RunStatus, RunStore};
use crate::db::{DbError, DbOperation, DbPool, DbValue, WhereClause};
use crate::store::StoreError;

const RUN_COLUMNS: &str = "id, consumer_id, endpoint_id, endpoint_url, status, blocks_processed, \
     events_extracted, errors_count, retry_count, start_block, end_block, execution_time_ms, \
     blocks_per_second, started_at, finished_at, error_message, stack_trace";

pub struct PgRunStore {
    pool: Arc<DbPool>,
}

impl PgRunStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &Row) -> Result<ProcessingRun, DbError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<RunStatus>().map_err(DbError::RowShape)?;
    let execution_time_ms: Option<i64> = row.try_get("execution_time_ms")?;
    Ok(ProcessingRun {
        id: row.try_get("id")?,
        consumer_id: row.try_get("consumer_id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        endpoint_url: row.try_get("endpoint_url")?,
        status,
        blocks_processed: row.try_get::<_, i64>("blocks_processed")? as u64,
        events_extracted: row.try_get::<_, i64>("events_extracted")? as u64,
        errors_count: row.try_get::<_, i64>("errors_count")? as u64,
        retry_count: row.try_get::<_, i64>("retry_count")? as u32,
        start_block: row.try_get::<_, i64>("start_block")? as u64,
        end_block: row.try_get::<_, i64>("end_block")? as u64,
        execution_time_ms: execution_time_ms.map(|ms| ms as u64),
        blocks_per_second: row.try_get("blocks_per_second")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_message: row.try_get("error_message")?,
        stack_trace: row.try_get("stack_trace")?,
    })
}

/// Placeholder numbering continues after the six SET columns of `complete_run`.
fn finalize_where(id: i64) -> WhereClause {
    WhereClause::Raw {
        condition: format!("\"id\" = $7 AND \"status\" = '{}'", RunStatus::Processing),
        params: vec![DbValue::Int64(id)],
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn open_run(&self, run: &NewRun) -> Result<i64, StoreError> {
        let row = self
            .pool
            .query_opt(
                "INSERT INTO processing_runs \
                 (consumer_id, endpoint_id, endpoint_url, status, retry_count, start_block, end_block) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
                &[
                    DbValue::Text(run.consumer_id.clone()),
                    DbValue::Int64(run.endpoint_id),
                    DbValue::Text(run.endpoint_url.clone()),
                    DbValue::Text(RunStatus::Processing.to_string()),
                    DbValue::Int64(run.retry_count as i64),
                    DbValue::Uint64(run.start_block),
                    DbValue::Uint64(run.end_block),
                ],
            )
            .await?
            .ok_or_else(|| DbError::RowShape("insert returned no id".to_string()))?;
        Ok(row.try_get::<_, i64>("id").map_err(DbError::from)?)
    }

    async fn complete_run(&self, id: i64, completion: &RunCompletion) -> Result<bool, StoreError> {
        let n = self
            .pool
            .execute_transaction(vec![DbOperation::Update {
                table: "processing_runs".to_string(),
                set_columns: vec![
                    ("status".to_string(), DbValue::Text(RunStatus::Completed.to_string())),
                    ("blocks_processed".to_string(), DbValue::Uint64(completion.blocks_processed)),
                    ("events_extracted".to_string(), DbValue::Uint64(completion.events_extracted)),
                    ("execution_time_ms".to_string(), DbValue::Uint64(completion.execution_time_ms)),
                    ("blocks_per_second".to_string(), DbValue::Float64(completion.blocks_per_second)),
                    ("finished_at".to_string(), DbValue::Timestamp(Utc::now())),
                ],
                where_clause: finalize_where(id),
            }])
            .await?;
        Ok(n > 0)
    }

    async fn fail_run(&self, id: i64, failure: &RunFailure) -> Result<bool, StoreError> {
        let n = self
            .pool
            .execute(
                "UPDATE processing_runs SET \
                   status = $2, error_message = $3, stack_trace = $4, \
                   execution_time_ms = $5, errors_count = errors_count + $6, finished_at = NOW() \
                 WHERE id = $1 AND status = 'processing'",
                &[
                    DbValue::Int64(id),
                    DbValue::Text(RunStatus::Failed.to_string()),
                    DbValue::Text(failure.error_message.clone()),
                    DbValue::opt_text(failure.stack_trace.as_deref()),
                    DbValue::Uint64(failure.execution_time_ms),
                    DbValue::Uint64(failure.errors_count),
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn fail_open_runs(
        &self,
        endpoint_id: i64,
        consumer_id: Option<&str>,
        message: &str,
    ) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(
                "UPDATE processing_runs SET \
                   status = 'failed', error_message = $3, errors_count = errors_count + 1, \
                   finished_at = NOW() \
                 WHERE endpoint_id = $1 AND status = 'processing' \
                   AND ($2::TEXT IS NULL OR consumer_id = $2)",
                &[
                    DbValue::Int64(endpoint_id),
                    DbValue::opt_text(consumer_id),
                    DbValue::Text(message.to_string()),
                ],
            )
            .await?)
    }

    async fn get_run(&self, id: i64) -> Result<Option<ProcessingRun>, StoreError> {
        let sql = format!("SELECT {} FROM processing_runs WHERE id = $1", RUN_COLUMNS);
        let row = self.pool.query_opt(&sql, &[DbValue::Int64(id)]).await?;
        Ok(row.as_ref().map(run_from_row).transpose()?)
    }

    async fn runs_for_range(&self, start_block: u64, end_block: u64) -> Result<Vec<ProcessingRun>, StoreError> {
        let sql = format!(
            "SELECT {} FROM processing_runs WHERE start_block = $1 AND end_block = $2 ORDER BY id",
            RUN_COLUMNS
        );
        let rows = self
            .pool
            .query(&sql, &[DbValue::Uint64(start_block), DbValue::Uint64(end_block)])
            .await?;
        Ok(rows.iter().map(run_from_row).collect::<Result<_, _>>()?)
    }

    async fn active_runs(&self) -> Result<Vec<ProcessingRun>, StoreError> {
        let sql = format!(
            "SELECT {} FROM processing_runs WHERE status = 'processing' ORDER BY started_at",
            RUN_COLUMNS
        );
        let rows = self.pool.query(&sql, &[]).await?;
        Ok(rows.iter().map(run_from_row).collect::<Result<_, _>>()?)
    }

    async fn global_stats(&self) -> Result<GlobalStats, StoreError> {
        let row = self
            .pool
            .query_opt(
                "SELECT \
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                   COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                   COALESCE(SUM(blocks_processed) FILTER (WHERE status = 'completed'), 0)::BIGINT AS total_blocks, \
                   COALESCE(SUM(events_extracted) FILTER (WHERE status = 'completed'), 0)::BIGINT AS total_events, \
                   (AVG(execution_time_ms) FILTER (WHERE status = 'completed'))::DOUBLE PRECISION AS avg_ms \
                 FROM processing_runs",
                &[],
            )
            .await?;
        let Some(row) = row else {
            return Ok(GlobalStats::default());
        };
        let get = |name: &str| -> Result<u64, DbError> { Ok(row.try_get::<_, i64>(name)? as u64) };
        Ok(GlobalStats {
            completed: get("completed")?,
            failed: get("failed")?,
            processing: get("processing")?,
            total_blocks: get("total_blocks")?,
            total_events: get("total_events")?,
            avg_execution_time_ms: row.try_get("avg_ms").map_err(DbError::from)?,
        })
    }
}

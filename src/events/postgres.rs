use std::sync::Arc;

use async_trait::async_trait;

use super::{DecodedEvent, EventStore, MissingSignature, MAX_PARAMS, UNKNOWN_EVENT};
use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::store::StoreError;

pub struct PgEventStore {
    pool: Arc<DbPool>,
}

impl PgEventStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

fn event_columns() -> Vec<String> {
    let mut columns: Vec<String> = [
        "block_hash",
        "transaction_hash",
        "block_number",
        "transaction_index",
        "log_index",
        "contract_address",
        "event_name",
        "event_signature",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.extend((1..=MAX_PARAMS).map(|i| format!("param_{}", i)));
    columns.push("block_timestamp".to_string());
    columns
}

fn event_values(event: &DecodedEvent) -> Vec<DbValue> {
    let mut values = vec![
        DbValue::Text(event.block_hash.clone()),
        DbValue::Text(event.transaction_hash.clone()),
        DbValue::Uint64(event.block_number),
        DbValue::Uint64(event.transaction_index),
        DbValue::Uint64(event.log_index),
        DbValue::Text(event.contract_address.clone()),
        DbValue::opt_text(event.event_name.as_deref()),
        DbValue::Text(event.event_signature.clone()),
    ];
    values.extend((0..MAX_PARAMS).map(|slot| DbValue::opt_text(event.param(slot))));
    values.push(DbValue::opt_timestamp(event.block_timestamp));
    values
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_batch(&self, events: &[DecodedEvent]) -> Result<u64, StoreError> {
        let columns = event_columns();
        let operations = events
            .iter()
            .map(|event| DbOperation::Insert {
                table: "events".to_string(),
                columns: columns.clone(),
                values: event_values(event),
            })
            .collect();
        Ok(self.pool.execute_transaction(operations).await?)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = self
            .pool
            .query_opt("SELECT COUNT(*) AS n FROM events", &[])
            .await?;
        let n: i64 = match row {
            Some(row) => row.try_get("n").map_err(DbError::from)?,
            None => 0,
        };
        Ok(n as u64)
    }

    async fn backfill_event_names(&self) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(
                "UPDATE events e SET event_name = sc.event_name \
                 FROM signature_cache sc \
                 WHERE e.event_signature = sc.signature \
                   AND sc.event_name <> $1 \
                   AND (e.event_name IS NULL OR e.event_name = $1)",
                &[DbValue::Text(UNKNOWN_EVENT.to_string())],
            )
            .await?)
    }

    async fn missing_signatures(&self, limit: usize) -> Result<Vec<MissingSignature>, StoreError> {
        let rows = self
            .pool
            .query(
                "SELECT e.event_signature AS signature, COUNT(*) AS occurrences \
                 FROM events e \
                 LEFT JOIN signature_cache sc ON sc.signature = e.event_signature \
                 WHERE sc.signature IS NULL AND e.event_signature <> '' \
                 GROUP BY e.event_signature \
                 ORDER BY occurrences DESC, e.event_signature \
                 LIMIT $1",
                &[DbValue::Int64(limit as i64)],
            )
            .await?;
        let mut missing = Vec::with_capacity(rows.len());
        for row in &rows {
            missing.push(MissingSignature {
                signature: row.try_get("signature").map_err(DbError::from)?,
                occurrences: row.try_get::<_, i64>("occurrences").map_err(DbError::from)? as u64,
            });
        }
        Ok(missing)
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Row;

use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::store::StoreError;

/// One persisted signature resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub signature: String,
    pub event_name: String,
    pub text_signature: Option<String>,
    pub source: String,
    pub hit_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCacheEntry {
    pub signature: String,
    pub event_name: String,
    pub text_signature: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: u64,
    pub unknown: u64,
    pub by_source: Vec<(String, u64)>,
    pub most_used: Vec<CacheEntry>,
    pub least_recently_used: Vec<CacheEntry>,
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Reads an entry and, on a hit, increments `hit_count` and refreshes
    /// `last_used_at` in the same statement.
    async fn get_and_touch(&self, signature: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Inserts unless the signature already has an entry.
    async fn insert(&self, entry: &NewCacheEntry) -> Result<(), StoreError>;

    /// Deletes entries last used before `older_than` with fewer than
    /// `min_hit_count` hits.
    async fn cleanup(&self, older_than: DateTime<Utc>, min_hit_count: u64) -> Result<u64, StoreError>;

    async fn export_all(&self) -> Result<Vec<CacheEntry>, StoreError>;

    /// Totals plus the `top` most used and `top` least recently used entries.
    async fn stats(&self, top: usize) -> Result<CacheStats, StoreError>;

    async fn truncate(&self) -> Result<u64, StoreError>;
}

const ENTRY_COLUMNS: &str =
    "signature, event_name, text_signature, source, hit_count, first_seen_at, last_used_at";

pub struct PgSignatureStore {
    pool: Arc<DbPool>,
}

impl PgSignatureStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn entries(&self, order_by: &str, limit: usize) -> Result<Vec<CacheEntry>, DbError> {
        let sql = format!(
            "SELECT {} FROM signature_cache ORDER BY {} LIMIT $1",
            ENTRY_COLUMNS, order_by
        );
        let rows = self.pool.query(&sql, &[DbValue::Int64(limit as i64)]).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &Row) -> Result<CacheEntry, DbError> {
    Ok(CacheEntry {
        signature: row.try_get("signature")?,
        event_name: row.try_get("event_name")?,
        text_signature: row.try_get("text_signature")?,
        source: row.try_get("source")?,
        hit_count: row.try_get::<_, i64>("hit_count")? as u64,
        first_seen_at: row.try_get("first_seen_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

#[async_trait]
impl SignatureStore for PgSignatureStore {
    async fn get_and_touch(&self, signature: &str) -> Result<Option<CacheEntry>, StoreError> {
        let sql = format!(
            "UPDATE signature_cache SET hit_count = hit_count + 1, last_used_at = NOW() \
             WHERE signature = $1 RETURNING {}",
            ENTRY_COLUMNS
        );
        let row = self
            .pool
            .query_opt(&sql, &[DbValue::Text(signature.to_string())])
            .await?;
        Ok(row.as_ref().map(entry_from_row).transpose()?)
    }

    async fn insert(&self, entry: &NewCacheEntry) -> Result<(), StoreError> {
        let columns = ["signature", "event_name", "text_signature", "source"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        self.pool
            .execute_transaction(vec![DbOperation::Upsert {
                table: "signature_cache".to_string(),
                columns,
                values: vec![
                    DbValue::Text(entry.signature.clone()),
                    DbValue::Text(entry.event_name.clone()),
                    DbValue::opt_text(entry.text_signature.as_deref()),
                    DbValue::Text(entry.source.clone()),
                ],
                conflict_columns: vec!["signature".to_string()],
                update_columns: vec![],
            }])
            .await?;
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>, min_hit_count: u64) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(
                "DELETE FROM signature_cache WHERE last_used_at < $1 AND hit_count < $2",
                &[DbValue::Timestamp(older_than), DbValue::Uint64(min_hit_count)],
            )
            .await?)
    }

    async fn export_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let sql = format!("SELECT {} FROM signature_cache ORDER BY signature", ENTRY_COLUMNS);
        let rows = self.pool.query(&sql, &[]).await?;
        Ok(rows.iter().map(entry_from_row).collect::<Result<_, _>>()?)
    }

    async fn stats(&self, top: usize) -> Result<CacheStats, StoreError> {
        let rows = self
            .pool
            .query(
                "SELECT source, COUNT(*) AS n, \
                   COUNT(*) FILTER (WHERE event_name = 'Unknown') AS unknown \
                 FROM signature_cache GROUP BY source ORDER BY source",
                &[],
            )
            .await?;
        let mut stats = CacheStats::default();
        for row in &rows {
            let source: String = row.try_get("source").map_err(DbError::from)?;
            let n = row.try_get::<_, i64>("n").map_err(DbError::from)? as u64;
            let unknown = row.try_get::<_, i64>("unknown").map_err(DbError::from)? as u64;
            stats.total += n;
            stats.unknown += unknown;
            stats.by_source.push((source, n));
        }
        stats.most_used = self.entries("hit_count DESC, signature", top).await?;
        stats.least_recently_used = self.entries("last_used_at ASC, signature", top).await?;
        Ok(stats)
    }

    async fn truncate(&self) -> Result<u64, StoreError> {
        Ok(self.pool.execute("DELETE FROM signature_cache", &[]).await?)
    }
}

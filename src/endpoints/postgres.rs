use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use super::{DeleteOutcome, Endpoint, EndpointStore, NewEndpoint, ReclaimedLease, UpsertOutcome};
use crate::db::{DbError, DbPool, DbValue};
use crate::store::StoreError;

const ENDPOINT_COLUMNS: &str = "id, name, url, active, in_use, lease_holder, leased_at, \
     last_known_block, last_health_check_at, last_error";

pub struct PgEndpointStore {
    pool: Arc<DbPool>,
}

impl PgEndpointStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

fn endpoint_from_row(row: &Row) -> Result<Endpoint, DbError> {
    let last_known_block: Option<i64> = row.try_get("last_known_block")?;
    Ok(Endpoint {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        in_use: row.try_get("in_use")?,
        lease_holder: row.try_get("lease_holder")?,
        leased_at: row.try_get("leased_at")?,
        last_known_block: last_known_block.map(|b| b as u64),
        last_health_check_at: row.try_get("last_health_check_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn eligible(&self) -> Result<Vec<Endpoint>, StoreError> {
        let sql = format!(
            "SELECT {} FROM endpoints WHERE active AND NOT in_use ORDER BY id",
            ENDPOINT_COLUMNS
        );
        let rows = self.pool.query(&sql, &[]).await?;
        Ok(rows.iter().map(endpoint_from_row).collect::<Result<_, _>>()?)
    }

    async fn try_lease(&self, id: i64, holder: &str) -> Result<Option<Endpoint>, StoreError> {
        // The WHERE re-checks eligibility, so of two concurrent updates only
        // one matches the row.
        let sql = format!(
            "UPDATE endpoints \
             SET in_use = TRUE, lease_holder = $2, leased_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND active AND NOT in_use \
             RETURNING {}",
            ENDPOINT_COLUMNS
        );
        let row = self
            .pool
            .query_opt(&sql, &[DbValue::Int64(id), DbValue::Text(holder.to_string())])
            .await?;
        Ok(row.as_ref().map(endpoint_from_row).transpose()?)
    }

    async fn release(&self, id: i64) -> Result<bool, StoreError> {
        let n = self
            .pool
            .execute(
                "UPDATE endpoints \
                 SET in_use = FALSE, lease_holder = NULL, leased_at = NULL, updated_at = NOW() \
                 WHERE id = $1 AND in_use",
                &[DbValue::Int64(id)],
            )
            .await?;
        Ok(n > 0)
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let n = self
            .pool
            .execute(
                "UPDATE endpoints SET active = $2, updated_at = NOW() WHERE id = $1",
                &[DbValue::Int64(id), DbValue::Bool(active)],
            )
            .await?;
        Ok(n > 0)
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let rows = self
            .pool
            .query("SELECT COUNT(*) AS n FROM endpoints WHERE active", &[])
            .await?;
        let n: i64 = match rows.first() {
            Some(row) => row.try_get("n").map_err(DbError::from)?,
            None => 0,
        };
        Ok(n as u64)
    }

    async fn list(&self) -> Result<Vec<Endpoint>, StoreError> {
        let sql = format!("SELECT {} FROM endpoints ORDER BY id", ENDPOINT_COLUMNS);
        let rows = self.pool.query(&sql, &[]).await?;
        Ok(rows.iter().map(endpoint_from_row).collect::<Result<_, _>>()?)
    }

    async fn get(&self, id: i64) -> Result<Option<Endpoint>, StoreError> {
        let sql = format!("SELECT {} FROM endpoints WHERE id = $1", ENDPOINT_COLUMNS);
        let row = self.pool.query_opt(&sql, &[DbValue::Int64(id)]).await?;
        Ok(row.as_ref().map(endpoint_from_row).transpose()?)
    }

    async fn upsert(&self, endpoint: &NewEndpoint) -> Result<UpsertOutcome, StoreError> {
        // xmax = 0 only for freshly inserted tuples.
        let row = self
            .pool
            .query_opt(
                "INSERT INTO endpoints (name, url, active, last_known_block, last_error) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (url) DO UPDATE SET \
                   name = EXCLUDED.name, \
                   active = EXCLUDED.active, \
                   last_known_block = COALESCE(EXCLUDED.last_known_block, endpoints.last_known_block), \
                   last_error = EXCLUDED.last_error, \
                   updated_at = NOW() \
                 RETURNING (xmax = 0) AS inserted",
                &[
                    DbValue::Text(endpoint.name.clone()),
                    DbValue::Text(endpoint.url.clone()),
                    DbValue::Bool(endpoint.active),
                    DbValue::opt_u64(endpoint.last_known_block),
                    DbValue::opt_text(endpoint.last_error.as_deref()),
                ],
            )
            .await?
            .ok_or_else(|| DbError::RowShape("upsert returned no row".to_string()))?;
        let inserted: bool = row.try_get("inserted").map_err(DbError::from)?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn delete_if_free(&self, id: i64) -> Result<DeleteOutcome, StoreError> {
        let n = self
            .pool
            .execute(
                "DELETE FROM endpoints WHERE id = $1 AND NOT in_use",
                &[DbValue::Int64(id)],
            )
            .await?;
        if n > 0 {
            return Ok(DeleteOutcome::Deleted);
        }
        Ok(match self.get(id).await? {
            Some(_) => DeleteOutcome::Leased,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn release_all(&self) -> Result<u64, StoreError> {
        Ok(self
            .pool
            .execute(
                "UPDATE endpoints \
                 SET in_use = FALSE, lease_holder = NULL, leased_at = NULL, updated_at = NOW() \
                 WHERE in_use",
                &[],
            )
            .await?)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReclaimedLease>, StoreError> {
        let rows = self
            .pool
            .query(
                "UPDATE endpoints e \
                 SET in_use = FALSE, lease_holder = NULL, leased_at = NULL, updated_at = NOW() \
                 FROM ( \
                   SELECT id, lease_holder, leased_at FROM endpoints \
                   WHERE in_use AND leased_at <= $1 \
                   FOR UPDATE \
                 ) stale \
                 WHERE e.id = stale.id \
                 RETURNING e.id, stale.lease_holder, stale.leased_at",
                &[DbValue::Timestamp(cutoff)],
            )
            .await?;
        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            reclaimed.push(ReclaimedLease {
                endpoint_id: row.try_get(0).map_err(DbError::from)?,
                holder: row.try_get(1).map_err(DbError::from)?,
                leased_at: row.try_get(2).map_err(DbError::from)?,
            });
        }
        Ok(reclaimed)
    }

    async fn record_health(
        &self,
        id: i64,
        last_known_block: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.pool
            .execute(
                "UPDATE endpoints SET \
                   last_known_block = COALESCE($2, last_known_block), \
                   last_error = $3, \
                   last_health_check_at = NOW(), \
                   updated_at = NOW() \
                 WHERE id = $1",
                &[
                    DbValue::Int64(id),
                    DbValue::opt_u64(last_known_block),
                    DbValue::opt_text(error),
                ],
            )
            .await?;
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Broker, Delivery, QueueError, QueueNames, Redelivery, WorkUnit};
use crate::db::{DbError, DbOperation, DbPool, DbValue, WhereClause};

/// Broker backed by the `queue_messages` table. Claims use
/// `FOR UPDATE SKIP LOCKED`, so concurrent consumers never receive the same
/// message.
pub struct PgBroker {
    pool: Arc<DbPool>,
}

impl PgBroker {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn delete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.pool
            .execute_transaction(vec![DbOperation::Delete {
                table: "queue_messages".to_string(),
                where_clause: WhereClause::Eq("id".to_string(), DbValue::Int64(delivery.tag)),
            }])
            .await?;
        Ok(())
    }
}

fn interval_ms(duration: Duration) -> DbValue {
    DbValue::Int64(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, queue: &str, unit: &WorkUnit, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_value(unit)?;
        self.pool
            .execute(
                "INSERT INTO queue_messages (queue, payload, available_at) \
                 VALUES ($1, $2, NOW() + ($3::BIGINT * INTERVAL '1 millisecond'))",
                &[DbValue::Text(queue.to_string()), DbValue::Json(payload), interval_ms(delay)],
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let row = self
            .pool
            .query_opt(
                "UPDATE queue_messages SET locked_by = $2, locked_at = NOW() \
                 WHERE id = ( \
                   SELECT id FROM queue_messages \
                   WHERE queue = $1 AND locked_by IS NULL AND available_at <= NOW() \
                   ORDER BY available_at, id \
                   LIMIT 1 \
                   FOR UPDATE SKIP LOCKED \
                 ) \
                 RETURNING id, payload",
                &[DbValue::Text(queue.to_string()), DbValue::Text(consumer.to_string())],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tag: i64 = row.try_get("id").map_err(DbError::from)?;
        let payload: serde_json::Value = row.try_get("payload").map_err(DbError::from)?;
        Ok(Some(Delivery {
            tag,
            queue: queue.to_string(),
            unit: serde_json::from_value(payload)?,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.delete(delivery).await
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.delete(delivery).await
    }

    async fn redeliver_due(&self, names: &QueueNames, max_retries: u32) -> Result<Redelivery, QueueError> {
        let rows = self
            .pool
            .query(
                "UPDATE queue_messages SET \
                   queue = CASE WHEN COALESCE((payload->>'retryCount')::BIGINT, 0) > $3 \
                                THEN $4 ELSE $2 END, \
                   available_at = NOW() \
                 WHERE queue = $1 AND locked_by IS NULL AND available_at <= NOW() \
                 RETURNING queue",
                &[
                    DbValue::Text(names.retry.clone()),
                    DbValue::Text(names.main.clone()),
                    DbValue::Int64(max_retries as i64),
                    DbValue::Text(names.dead_letter.clone()),
                ],
            )
            .await?;
        let mut outcome = Redelivery::default();
        for row in &rows {
            let queue: String = row.try_get("queue").map_err(DbError::from)?;
            if queue == names.dead_letter {
                outcome.dead_lettered += 1;
            } else {
                outcome.redelivered += 1;
            }
        }
        if outcome.dead_lettered > 0 {
            tracing::warn!("{} work units moved to {}", outcome.dead_lettered, names.dead_letter);
        }
        Ok(outcome)
    }

    async fn recover_unacked(&self, older_than: Duration) -> Result<u64, QueueError> {
        Ok(self
            .pool
            .execute(
                "UPDATE queue_messages SET locked_by = NULL, locked_at = NULL \
                 WHERE locked_by IS NOT NULL \
                   AND locked_at <= NOW() - ($1::BIGINT * INTERVAL '1 millisecond')",
                &[interval_ms(older_than)],
            )
            .await?)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let row = self
            .pool
            .query_opt(
                "SELECT COUNT(*) AS n FROM queue_messages WHERE queue = $1",
                &[DbValue::Text(queue.to_string())],
            )
            .await?;
        let n: i64 = match row {
            Some(row) => row.try_get("n").map_err(DbError::from)?,
            None => 0,
        };
        Ok(n as u64)
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self
            .pool
            .execute_transaction(vec![DbOperation::Delete {
                table: "queue_messages".to_string(),
                where_clause: WhereClause::Eq("queue".to_string(), DbValue::Text(queue.to_string())),
            }])
            .await?)
    }
}

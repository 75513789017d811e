//! Decoded event rows and the maintenance queries that run over them.

mod postgres;

pub use postgres::PgEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::StoreError;

/// Positional parameter slots per event row.
pub const MAX_PARAMS: usize = 20;

/// Name recorded for signatures the lookup service does not know.
pub const UNKNOWN_EVENT: &str = "Unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub block_hash: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub contract_address: String,
    pub event_name: Option<String>,
    pub event_signature: String,
    /// At most [`MAX_PARAMS`] 32-byte hex words; missing slots are stored as NULL.
    pub params: Vec<String>,
    pub block_timestamp: Option<DateTime<Utc>>,
}

impl DecodedEvent {
    pub fn param(&self, slot: usize) -> Option<&str> {
        self.params.get(slot).map(String::as_str)
    }
}

/// A signature seen in persisted events with no cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSignature {
    pub signature: String,
    pub occurrences: u64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists the whole batch or nothing.
    async fn insert_batch(&self, events: &[DecodedEvent]) -> Result<u64, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Fills `event_name` on rows that are NULL or `Unknown` from resolved
    /// cache entries. Returns the number of rows updated.
    async fn backfill_event_names(&self) -> Result<u64, StoreError>;

    /// Most frequent signatures with no cache entry at all.
    async fn missing_signatures(&self, limit: usize) -> Result<Vec<MissingSignature>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::{NewCacheEntry, SignatureStore};
    use crate::store::MemoryStore;

    fn event(log_index: u64, signature: &str, name: Option<&str>) -> DecodedEvent {
        DecodedEvent {
            block_hash: "0xblock".to_string(),
            transaction_hash: "0xtx".to_string(),
            block_number: 100,
            transaction_index: 0,
            log_index,
            contract_address: "0xcontract".to_string(),
            event_name: name.map(str::to_string),
            event_signature: signature.to_string(),
            params: Vec::new(),
            block_timestamp: None,
        }
    }

    fn cache_entry(signature: &str, name: &str) -> NewCacheEntry {
        NewCacheEntry {
            signature: signature.to_string(),
            event_name: name.to_string(),
            text_signature: None,
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_batch_insert_is_atomic() {
        let store = MemoryStore::new();
        let batch: Vec<DecodedEvent> = (0..10).map(|i| event(i, "0xaa", None)).collect();

        store.fail_batch_at_event(5);
        assert!(store.insert_batch(&batch).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);

        assert_eq!(store.insert_batch(&batch).await.unwrap(), 10);
        assert_eq!(store.count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_backfill_fills_null_and_unknown_names() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[
                event(0, "0xaa", None),
                event(1, "0xaa", Some(UNKNOWN_EVENT)),
                event(2, "0xaa", Some("Transfer")),
                event(3, "0xbb", None),
                event(4, "0xcc", None),
            ])
            .await
            .unwrap();
        store.insert(&cache_entry("0xaa", "Transfer")).await.unwrap();
        store.insert(&cache_entry("0xbb", UNKNOWN_EVENT)).await.unwrap();

        assert_eq!(store.backfill_event_names().await.unwrap(), 2);
        let events = store.events();
        assert_eq!(events[0].event_name.as_deref(), Some("Transfer"));
        assert_eq!(events[1].event_name.as_deref(), Some("Transfer"));
        assert!(events[3].event_name.is_none());
    }

    #[tokio::test]
    async fn test_missing_signatures_most_frequent_first() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[
                event(0, "0xaa", None),
                event(1, "0xbb", None),
                event(2, "0xbb", None),
                event(3, "0xcc", None),
                event(4, "", None),
            ])
            .await
            .unwrap();
        store.insert(&cache_entry("0xcc", "Sync")).await.unwrap();

        let missing = store.missing_signatures(10).await.unwrap();
        assert_eq!(
            missing,
            vec![
                MissingSignature {
                    signature: "0xbb".to_string(),
                    occurrences: 2
                },
                MissingSignature {
                    signature: "0xaa".to_string(),
                    occurrences: 1
                },
            ]
        );
        assert_eq!(store.missing_signatures(1).await.unwrap().len(), 1);
    }
}

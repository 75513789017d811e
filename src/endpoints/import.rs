//! Bulk provisioning of endpoints from a JSON file.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::{EndpointStore, NewEndpoint, UpsertOutcome};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read endpoint file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse endpoint file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entry of the import file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub name: String,
    pub url: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_block: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_active() -> bool {
    true
}

impl From<EndpointRecord> for NewEndpoint {
    fn from(record: EndpointRecord) -> Self {
        Self {
            name: record.name,
            url: record.url,
            active: record.active,
            last_known_block: record.last_block,
            last_error: record.error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub active: usize,
    pub inactive: usize,
}

pub fn parse_records(contents: &str) -> Result<Vec<EndpointRecord>, ImportError> {
    Ok(serde_json::from_str(contents)?)
}

pub async fn import_file(
    store: &dyn EndpointStore,
    path: impl AsRef<Path>,
) -> Result<ImportReport, ImportError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let records = parse_records(&contents)?;
    tracing::info!(
        "Importing {} endpoints from {}",
        records.len(),
        path.as_ref().display()
    );
    import_records(store, records).await
}

/// Upserts each record by `url`. Records with an empty name or URL are skipped.
pub async fn import_records(
    store: &dyn EndpointStore,
    records: Vec<EndpointRecord>,
) -> Result<ImportReport, ImportError> {
    let mut report = ImportReport::default();
    for record in records {
        if record.url.trim().is_empty() || record.name.trim().is_empty() {
            tracing::warn!("Skipping endpoint record with empty name or url: {:?}", record);
            report.skipped += 1;
            continue;
        }
        if record.active {
            report.active += 1;
        } else {
            report.inactive += 1;
        }
        match store.upsert(&record.into()).await? {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
        }
    }
    tracing::info!(
        "Endpoint import done: {} inserted, {} updated, {} skipped ({} active, {} inactive)",
        report.inserted,
        report.updated,
        report.skipped,
        report.active,
        report.inactive
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const SAMPLE: &str = r#"[
        {"name": "alpha", "url": "http://alpha:8545", "active": true, "lastBlock": 18000500},
        {"name": "beta", "url": "http://beta:8545", "active": false, "error": "timeout"},
        {"name": "", "url": "http://blank:8545"}
    ]"#;

    #[test]
    fn test_parse_records_camel_case() {
        let records = parse_records(SAMPLE).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].last_block, Some(18_000_500));
        assert!(!records[1].active);
        assert_eq!(records[1].error.as_deref(), Some("timeout"));
        assert!(records[2].active);
    }

    #[tokio::test]
    async fn test_import_upserts_by_url() {
        let store = MemoryStore::new();
        let report = import_records(&store, parse_records(SAMPLE).unwrap())
            .await
            .unwrap();
        assert_eq!(
            report,
            ImportReport {
                inserted: 2,
                updated: 0,
                skipped: 1,
                active: 1,
                inactive: 1,
            }
        );

        let again = import_records(&store, parse_records(SAMPLE).unwrap())
            .await
            .unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 2);
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.count_active().await.unwrap(), 1);
    }
}

//! Upstream RPC endpoints and their exclusive leases.
//!
//! Consumers run as independent processes, so the lease check-and-set lives
//! in the store as a single conditional update (`active AND NOT in_use`),
//! never behind an in-process lock.

pub mod import;
mod pool;
mod postgres;

pub use pool::{EndpointPool, Lease, LeasedEndpoint, LockReport, PoolError};
pub use postgres::PgEndpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Administratively enabled
    pub active: bool,
    pub in_use: bool,
    pub lease_holder: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub last_known_block: Option<u64>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Endpoint {
    pub fn is_eligible(&self) -> bool {
        self.active && !self.in_use
    }
}

/// Provisioning record for a bulk import, keyed by `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    pub active: bool,
    pub last_known_block: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Leased,
}

/// A lease taken back from a holder that never released it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedLease {
    pub endpoint_id: i64,
    pub holder: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Endpoints that are `active AND NOT in_use` at the time of the read.
    async fn eligible(&self) -> Result<Vec<Endpoint>, StoreError>;

    /// Atomically leases `id` to `holder` iff it is still eligible.
    /// Returns `None` when another holder won the race or the endpoint was
    /// deactivated in between.
    async fn try_lease(&self, id: i64, holder: &str) -> Result<Option<Endpoint>, StoreError>;

    /// Clears the lease regardless of holder. Returns whether a lease was held.
    async fn release(&self, id: i64) -> Result<bool, StoreError>;

    async fn set_active(&self, id: i64, active: bool) -> Result<bool, StoreError>;

    async fn count_active(&self) -> Result<u64, StoreError>;

    async fn list(&self) -> Result<Vec<Endpoint>, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Endpoint>, StoreError>;

    async fn upsert(&self, endpoint: &NewEndpoint) -> Result<UpsertOutcome, StoreError>;

    /// Deletes `id` only if it is not leased, as one conditional statement.
    async fn delete_if_free(&self, id: i64) -> Result<DeleteOutcome, StoreError>;

    async fn release_all(&self) -> Result<u64, StoreError>;

    /// Releases every lease taken at or before `cutoff`.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReclaimedLease>, StoreError>;

    /// Records the outcome of a liveness probe.
    async fn record_health(
        &self,
        id: i64,
        last_known_block: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

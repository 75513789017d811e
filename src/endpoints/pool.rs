use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use thiserror::Error;

use super::{DeleteOutcome, Endpoint, EndpointStore, ReclaimedLease};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No endpoint available")]
    NoEndpointAvailable,

    #[error("Endpoint {id} is leased by {holder}")]
    EndpointLeased { id: i64, holder: String },

    #[error("Endpoint {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot of every endpoint currently leased, for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct LockReport {
    pub total: usize,
    pub in_use: usize,
    /// Active and not leased
    pub available: usize,
    pub inactive: usize,
    pub leased: Vec<LeasedEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeasedEndpoint {
    pub id: i64,
    pub name: String,
    pub holder: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct EndpointPool {
    store: Arc<dyn EndpointStore>,
}

impl EndpointPool {
    pub fn new(store: Arc<dyn EndpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EndpointStore> {
        &self.store
    }

    /// Leases one eligible endpoint to `holder`.
    ///
    /// Candidates are tried in random order so concurrent consumers spread
    /// across the pool instead of all racing for the first row.
    pub async fn acquire(&self, holder: &str) -> Result<Lease, PoolError> {
        let mut candidates = self.store.eligible().await?;
        if candidates.is_empty() {
            return Err(PoolError::NoEndpointAvailable);
        }
        candidates.shuffle(&mut rand::rng());

        for candidate in candidates {
            if let Some(endpoint) = self.store.try_lease(candidate.id, holder).await? {
                tracing::debug!("{} leased endpoint {} ({})", holder, endpoint.id, endpoint.name);
                return Ok(Lease::new(endpoint, self.store.clone()));
            }
        }

        Err(PoolError::NoEndpointAvailable)
    }

    /// Retries [`acquire`](Self::acquire) up to `attempts` times, sleeping
    /// `backoff` between empty-pool results. Store errors abort immediately.
    pub async fn acquire_with_retry(
        &self,
        holder: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Lease, PoolError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.acquire(holder).await {
                Ok(lease) => return Ok(lease),
                Err(PoolError::NoEndpointAvailable) if attempt < attempts => {
                    tracing::debug!(
                        "No endpoint for {} (attempt {}/{}), waiting {:?}",
                        holder,
                        attempt,
                        attempts,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PoolError::NoEndpointAvailable)
    }

    /// Clears a lease by id. Releasing an unleased endpoint is a no-op.
    pub async fn release(&self, id: i64) -> Result<(), PoolError> {
        let was_held = self.store.release(id).await?;
        if !was_held {
            tracing::debug!("Endpoint {} was not leased", id);
        }
        Ok(())
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<(), PoolError> {
        if self.store.set_active(id, active).await? {
            Ok(())
        } else {
            Err(PoolError::NotFound(id))
        }
    }

    pub async fn count_active(&self) -> Result<u64, PoolError> {
        Ok(self.store.count_active().await?)
    }

    pub async fn list(&self) -> Result<Vec<Endpoint>, PoolError> {
        Ok(self.store.list().await?)
    }

    pub async fn record_health(
        &self,
        id: i64,
        last_known_block: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), PoolError> {
        Ok(self.store.record_health(id, last_known_block, error).await?)
    }

    pub async fn delete(&self, id: i64) -> Result<(), PoolError> {
        match self.store.delete_if_free(id).await? {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::NotFound => Err(PoolError::NotFound(id)),
            DeleteOutcome::Leased => {
                let holder = self
                    .store
                    .get(id)
                    .await?
                    .and_then(|e| e.lease_holder)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(PoolError::EndpointLeased { id, holder })
            }
        }
    }

    pub async fn lock_report(&self) -> Result<LockReport, PoolError> {
        let endpoints = self.store.list().await?;
        let leased: Vec<LeasedEndpoint> = endpoints
            .iter()
            .filter(|e| e.in_use)
            .map(|e| LeasedEndpoint {
                id: e.id,
                name: e.name.clone(),
                holder: e.lease_holder.clone(),
                leased_at: e.leased_at,
            })
            .collect();
        Ok(LockReport {
            total: endpoints.len(),
            in_use: leased.len(),
            available: endpoints.iter().filter(|e| e.is_eligible()).count(),
            inactive: endpoints.iter().filter(|e| !e.active).count(),
            leased,
        })
    }

    /// Operator reset: clears every lease.
    pub async fn force_release_all(&self) -> Result<u64, PoolError> {
        let released = self.store.release_all().await?;
        tracing::warn!("Force-released {} endpoint leases", released);
        Ok(released)
    }

    /// Releases leases older than `max_age`.
    pub async fn reclaim_stale(&self, max_age: Duration) -> Result<Vec<ReclaimedLease>, PoolError> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.store.release_stale(cutoff).await?)
    }
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool").finish_non_exhaustive()
    }
}

/// An exclusive claim on one endpoint.
///
/// Call [`release`](Lease::release) on every exit path. If a lease is dropped
/// unreleased (a panic, a cancelled task) a best-effort release is spawned on
/// the current runtime.
pub struct Lease {
    endpoint: Endpoint,
    store: Arc<dyn EndpointStore>,
    released: bool,
}

impl Lease {
    fn new(endpoint: Endpoint, store: Arc<dyn EndpointStore>) -> Self {
        Self {
            endpoint,
            store,
            released: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn id(&self) -> i64 {
        self.endpoint.id
    }

    pub async fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.store.release(self.endpoint.id).await?;
        tracing::debug!("Released endpoint {}", self.endpoint.id);
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.endpoint.id;
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Lease on endpoint {} dropped without release", id);
                handle.spawn(async move {
                    if let Err(e) = store.release(id).await {
                        tracing::error!("Deferred release of endpoint {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => {
                tracing::error!("Lease on endpoint {} dropped outside a runtime; left for the sweeper", id);
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.endpoint.id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::NewEndpoint;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    async fn pool_with(n: usize) -> (EndpointPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
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
        (EndpointPool::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_acquire_marks_endpoint_leased() {
        let (pool, store) = pool_with(1).await;
        let lease = pool.acquire("consumer-a").await.unwrap();
        let ep = store.get(lease.id()).await.unwrap().unwrap();
        assert!(ep.in_use);
        assert_eq!(ep.lease_holder.as_deref(), Some("consumer-a"));
        assert!(ep.leased_at.is_some());

        assert!(matches!(
            pool.acquire("consumer-b").await,
            Err(PoolError::NoEndpointAvailable)
        ));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_pool_reports_no_endpoint() {
        let (pool, _) = pool_with(0).await;
        assert!(matches!(
            pool.acquire("consumer-a").await,
            Err(PoolError::NoEndpointAvailable)
        ));
    }

    #[tokio::test]
    async fn test_inactive_endpoint_never_leased() {
        let (pool, _) = pool_with(1).await;
        let id = pool.list().await.unwrap()[0].id;
        pool.set_active(id, false).await.unwrap();
        assert!(matches!(
            pool.acquire("consumer-a").await,
            Err(PoolError::NoEndpointAvailable)
        ));
        assert_eq!(pool.count_active().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_is_exclusive() {
        let (pool, _) = pool_with(3).await;
        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire(&format!("consumer-{}", i)).await
            }));
        }

        let mut leases = Vec::new();
        let mut misses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(lease) => leases.push(lease),
                Err(PoolError::NoEndpointAvailable) => misses += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(leases.len(), 3);
        assert_eq!(misses, 7);
        let ids: HashSet<i64> = leases.iter().map(|l| l.id()).collect();
        assert_eq!(ids.len(), 3);
        for lease in leases {
            lease.release().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_endpoint_has_one_winner() {
        let (pool, store) = pool_with(1).await;
        let callers = 16;
        let barrier = Arc::new(tokio::sync::Barrier::new(callers));
        let mut handles = Vec::new();
        for i in 0..callers {
            let pool = pool.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                pool.acquire(&format!("consumer-{}", i)).await
            }));
        }

        let mut winners = Vec::new();
        let mut misses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(lease) => winners.push(lease),
                Err(PoolError::NoEndpointAvailable) => misses += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(misses, callers - 1);
        assert_eq!(store.leases_granted(), 1);
        let holder = store.get(winners[0].id()).await.unwrap().unwrap().lease_holder;
        assert!(holder.is_some_and(|h| h.starts_with("consumer-")));
        for lease in winners {
            lease.release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, store) = pool_with(1).await;
        let lease = pool.acquire("consumer-a").await.unwrap();
        let id = lease.id();
        lease.release().await.unwrap();
        pool.release(id).await.unwrap();
        pool.release(id).await.unwrap();

        let ep = store.get(id).await.unwrap().unwrap();
        assert!(!ep.in_use);
        assert!(ep.lease_holder.is_none());
        assert!(pool.acquire("consumer-b").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let (pool, store) = pool_with(1).await;
        let id = {
            let lease = pool.acquire("consumer-a").await.unwrap();
            lease.id()
        };
        // Give the spawned release a chance to run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!store.get(id).await.unwrap().unwrap().in_use);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_waits_for_release() {
        let (pool, _) = pool_with(1).await;
        let held = pool.acquire("consumer-a").await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_with_retry("consumer-b", 5, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        held.release().await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.endpoint().lease_holder.as_deref(), Some("consumer-b"));
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_gives_up() {
        let (pool, _) = pool_with(0).await;
        let result = pool
            .acquire_with_retry("consumer-a", 3, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(PoolError::NoEndpointAvailable)));
    }

    #[tokio::test]
    async fn test_delete_rejected_while_leased() {
        let (pool, _) = pool_with(1).await;
        let lease = pool.acquire("consumer-a").await.unwrap();
        let id = lease.id();

        match pool.delete(id).await {
            Err(PoolError::EndpointLeased { holder, .. }) => assert_eq!(holder, "consumer-a"),
            other => panic!("expected EndpointLeased, got {:?}", other),
        }
        lease.release().await.unwrap();
        pool.delete(id).await.unwrap();
        assert!(matches!(pool.delete(id).await, Err(PoolError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lock_report_and_force_release() {
        let (pool, _) = pool_with(3).await;
        let a = pool.acquire("consumer-a").await.unwrap();
        let b = pool.acquire("consumer-b").await.unwrap();

        let report = pool.lock_report().await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.in_use, 2);
        assert_eq!(report.available, 1);
        assert_eq!(report.inactive, 0);
        assert_eq!(report.leased.len(), 2);

        assert_eq!(pool.force_release_all().await.unwrap(), 2);
        assert!(pool.lock_report().await.unwrap().leased.is_empty());

        // Already released by the reset; explicit release stays a no-op.
        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_stale_only_touches_old_leases() {
        let (pool, _) = pool_with(2).await;
        let lease = pool.acquire("consumer-a").await.unwrap();

        let reclaimed = pool.reclaim_stale(Duration::from_secs(3600)).await.unwrap();
        assert!(reclaimed.is_empty());

        let reclaimed = pool.reclaim_stale(Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].endpoint_id, lease.id());
        assert_eq!(reclaimed[0].holder.as_deref(), Some("consumer-a"));
        lease.release().await.unwrap();
    }
}

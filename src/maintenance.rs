//! Recovery for consumers that died while holding an endpoint.

use std::time::Duration;

use crate::endpoints::{EndpointPool, PoolError};
use crate::metrics::RunStore;

pub const LEASE_RECLAIMED: &str = "lease reclaimed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leases_reclaimed: u64,
    pub runs_failed: u64,
}

/// Releases every lease older than `max_age` and fails the `processing` runs
/// the former holder left on that endpoint.
pub async fn sweep_stale_leases(
    pool: &EndpointPool,
    runs: &dyn RunStore,
    max_age: Duration,
) -> Result<SweepReport, PoolError> {
    let reclaimed = pool.reclaim_stale(max_age).await?;
    let mut report = SweepReport {
        leases_reclaimed: reclaimed.len() as u64,
        runs_failed: 0,
    };

    for lease in &reclaimed {
        tracing::warn!(
            "Reclaimed endpoint {} from {} (leased at {:?})",
            lease.endpoint_id,
            lease.holder.as_deref().unwrap_or("<unknown>"),
            lease.leased_at
        );
        let failed = runs
            .fail_open_runs(lease.endpoint_id, lease.holder.as_deref(), LEASE_RECLAIMED)
            .await?;
        report.runs_failed += failed;
    }

    if report.leases_reclaimed > 0 {
        tracing::info!(
            "Sweep reclaimed {} leases and failed {} orphaned runs",
            report.leases_reclaimed,
            report.runs_failed
        );
    }
    Ok(report)
}

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing_subscriber::EnvFilter;

use block_range_indexer::consumer::{BlockConsumer, ConsumerConfig};
use block_range_indexer::db::DbPool;
use block_range_indexer::endpoints::{import, EndpointPool, PgEndpointStore};
use block_range_indexer::events::{EventStore, PgEventStore};
use block_range_indexer::maintenance::sweep_stale_leases;
use block_range_indexer::metrics::{MetricsRecorder, PgRunStore};
use block_range_indexer::producer::BlockProducer;
use block_range_indexer::queue::{PgBroker, QueueClient, QueueError};
use block_range_indexer::rpc::RpcLogSourceFactory;
use block_range_indexer::signatures::{FourByteClient, PgSignatureStore, SignatureCache};
use block_range_indexer::types::config::IndexerConfig;

const DB_POOL_SIZE: usize = 16;
const USAGE: &str = "usage: block-range-indexer <command>

  migrate
  produce
  consume [instances]
  endpoints import <file> | unlock | status | sweep
  queue stats | purge <name> | requeue-dlq
  cache stats | cleanup <days> <min_hits> | export <file> | truncate
  events backfill | missing [limit]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    if args.is_empty() {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = IndexerConfig::load(&IndexerConfig::default_path())?;
    let db = Arc::new(
        DbPool::new(&config.database_url()?, DB_POOL_SIZE)
            .await
            .context("Failed to connect to database")?,
    );
    let app = App { config, db };

    match args.as_slice() {
        ["migrate"] => app.db.run_migrations().await?,
        ["produce"] => app.produce().await?,
        ["consume"] => app.consume(app.config.worker.instances).await?,
        ["consume", n] => app.consume(n.parse().context("instances must be a number")?).await?,
        ["endpoints", rest @ ..] => app.endpoints(rest).await?,
        ["queue", rest @ ..] => app.queue_admin(rest).await?,
        ["cache", rest @ ..] => app.cache(rest).await?,
        ["events", rest @ ..] => app.events(rest).await?,
        _ => anyhow::bail!("unknown command {:?}\n{}", args, USAGE),
    }
    Ok(())
}

struct App {
    config: IndexerConfig,
    db: Arc<DbPool>,
}

impl App {
    fn queue(&self) -> QueueClient {
        let queue = &self.config.queue;
        QueueClient::new(Arc::new(PgBroker::new(self.db.clone())), queue.names())
            .with_retry_delay(queue.retry_delay())
            .with_max_retries(queue.max_retries)
            .with_poll_interval(queue.poll_interval())
    }

    fn pool(&self) -> EndpointPool {
        EndpointPool::new(Arc::new(PgEndpointStore::new(self.db.clone())))
    }

    fn signature_cache(&self) -> anyhow::Result<Arc<SignatureCache>> {
        let sigs = &self.config.signatures;
        let remote = FourByteClient::new(sigs.api_url.clone(), sigs.timeout(), &sigs.user_agent)
            .context("Failed to build signature lookup client")?;
        Ok(Arc::new(
            SignatureCache::new(
                Arc::new(PgSignatureStore::new(self.db.clone())),
                Arc::new(remote),
            )
            .with_max_attempts(sigs.max_attempts),
        ))
    }

    async fn produce(&self) -> anyhow::Result<()> {
        let range = &self.config.range;
        let published = BlockProducer::new(self.queue())
            .produce_range(range.start_block, range.end_block, range.blocks_per_message)
            .await?;
        tracing::info!("Produced {} work units", published);
        Ok(())
    }

    async fn consume(&self, instances: usize) -> anyhow::Result<()> {
        let worker = &self.config.worker;
        let queue = self.queue();
        let pool = self.pool();
        let signatures = self.signature_cache()?;
        let events: Arc<dyn EventStore> = Arc::new(PgEventStore::new(self.db.clone()));
        let metrics = MetricsRecorder::new(Arc::new(PgRunStore::new(self.db.clone())));
        let sources = Arc::new(RpcLogSourceFactory::new(
            worker.rpc_timeout(),
            worker.rpc_requests_per_second,
        ));

        let report = sweep_stale_leases(&pool, metrics.store().as_ref(), worker.stale_lease_age()).await?;
        if report.leases_reclaimed > 0 {
            tracing::info!("Reclaimed {} stale leases before starting", report.leases_reclaimed);
        }
        queue.recover_unacked(worker.stale_lease_age()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for _ in 0..instances {
            let consumer = BlockConsumer::new(
                ConsumerConfig {
                    max_endpoint_attempts: worker.max_endpoint_attempts,
                    endpoint_backoff: worker.endpoint_backoff(),
                },
                pool.clone(),
                sources.clone(),
                signatures.clone(),
                events.clone(),
                metrics.clone(),
            );
            let queue = queue.clone();
            let shutdown = shutdown_rx.clone();
            workers.spawn(async move {
                let handled = consumer.run(&queue, shutdown).await;
                (consumer.id().to_string(), handled)
            });
        }
        tracing::info!("Started {} consumers", instances);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, stopping consumers after their current unit");
            }
            Some(joined) = workers.join_next() => {
                tracing::warn!("A consumer exited early, stopping the rest");
                report_exit(joined);
            }
        }
        shutdown_tx.send_replace(true);

        while let Some(joined) = workers.join_next().await {
            report_exit(joined);
        }
        Ok(())
    }

    async fn endpoints(&self, args: &[&str]) -> anyhow::Result<()> {
        let pool = self.pool();
        match args {
            ["import", file] => {
                let report = import::import_file(pool.store().as_ref(), file).await?;
                println!(
                    "inserted={} updated={} skipped={} active={} inactive={}",
                    report.inserted, report.updated, report.skipped, report.active, report.inactive
                );
            }
            ["unlock"] => {
                let released = pool.force_release_all().await?;
                println!("released {} leases", released);
            }
            ["status"] => {
                let report = pool.lock_report().await?;
                println!(
                    "total={} in_use={} available={} inactive={}",
                    report.total, report.in_use, report.available, report.inactive
                );
                for leased in &report.leased {
                    println!(
                        "  #{} {} held by {} since {}",
                        leased.id,
                        leased.name,
                        leased.holder.as_deref().unwrap_or("-"),
                        leased
                            .leased_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            ["sweep"] => {
                let runs = PgRunStore::new(self.db.clone());
                let report =
                    sweep_stale_leases(&pool, &runs, self.config.worker.stale_lease_age()).await?;
                println!(
                    "reclaimed {} leases, failed {} runs",
                    report.leases_reclaimed, report.runs_failed
                );
            }
            _ => anyhow::bail!("unknown endpoints command {:?}\n{}", args, USAGE),
        }
        Ok(())
    }

    async fn queue_admin(&self, args: &[&str]) -> anyhow::Result<()> {
        let queue = self.queue();
        match args {
            ["stats"] => {
                let stats = queue.stats().await?;
                let names = queue.names();
                println!("{}: {}", names.main, stats.main);
                println!("{}: {}", names.retry, stats.retry);
                println!("{}: {}", names.dead_letter, stats.dead_letter);
            }
            ["purge", name] => {
                let removed = queue.purge(name).await?;
                println!("purged {} messages from {}", removed, name);
            }
            ["requeue-dlq"] => {
                let moved = queue.requeue_dead_letters("operator").await?;
                println!("requeued {} units", moved);
            }
            _ => anyhow::bail!("unknown queue command {:?}\n{}", args, USAGE),
        }
        Ok(())
    }

    async fn cache(&self, args: &[&str]) -> anyhow::Result<()> {
        let cache = self.signature_cache()?;
        match args {
            ["stats"] => {
                let stats = cache.stats(10).await?;
                println!("total={} unknown={}", stats.total, stats.unknown);
                for (source, count) in &stats.by_source {
                    println!("  {}: {}", source, count);
                }
                for entry in &stats.most_used {
                    println!("  {} {} hits={}", entry.signature, entry.event_name, entry.hit_count);
                }
            }
            ["cleanup", days, min_hits] => {
                let days: u64 = days.parse().context("days must be a number")?;
                let min_hits: u64 = min_hits.parse().context("min_hits must be a number")?;
                let removed = cache.cleanup(cleanup_age(days)?, min_hits).await?;
                println!("removed {} entries", removed);
            }
            ["export", file] => {
                let entries = cache.export_all().await?;
                std::fs::write(file, serde_json::to_string_pretty(&entries)?)
                    .with_context(|| format!("Failed to write {}", file))?;
                println!("exported {} entries to {}", entries.len(), file);
            }
            ["truncate"] => {
                let removed = cache.truncate().await?;
                println!("removed {} entries", removed);
            }
            _ => anyhow::bail!("unknown cache command {:?}\n{}", args, USAGE),
        }
        Ok(())
    }

    async fn events(&self, args: &[&str]) -> anyhow::Result<()> {
        let events = PgEventStore::new(self.db.clone());
        match args {
            ["backfill"] => {
                let updated = events.backfill_event_names().await?;
                println!("named {} events", updated);
            }
            ["missing"] => print_missing(&events, 50).await?,
            ["missing", limit] => {
                print_missing(&events, limit.parse().context("limit must be a number")?).await?
            }
            _ => anyhow::bail!("unknown events command {:?}\n{}", args, USAGE),
        }
        Ok(())
    }
}

async fn print_missing(events: &PgEventStore, limit: usize) -> anyhow::Result<()> {
    for missing in events.missing_signatures(limit).await? {
        println!("{} {}", missing.signature, missing.occurrences);
    }
    Ok(())
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

fn cleanup_age(days: u64) -> anyhow::Result<Duration> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .with_context(|| format!("cleanup age of {} days is too large", days))
}

type WorkerExit = Result<(String, Result<u64, QueueError>), JoinError>;

fn report_exit(joined: WorkerExit) {
    match joined {
        Ok((id, Ok(handled))) => tracing::info!("{} handled {} units", id, handled),
        Ok((id, Err(e))) => tracing::error!("{} stopped with error: {}", id, e),
        Err(e) => tracing::error!("Consumer task panicked: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_age_in_days() {
        assert_eq!(cleanup_age(0).unwrap(), Duration::ZERO);
        assert_eq!(cleanup_age(30).unwrap(), Duration::from_secs(30 * SECS_PER_DAY));
    }

    #[test]
    fn test_cleanup_age_overflow_is_an_error() {
        let err = cleanup_age(u64::MAX).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}

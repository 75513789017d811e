use std::collections::HashSet;

use deadpool_postgres::Pool;

use super::error::DbError;

/// Schema migrations, applied in order and recorded by name in `_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_endpoints.sql", include_str!("../../migrations/001_endpoints.sql")),
    ("002_processing_runs.sql", include_str!("../../migrations/002_processing_runs.sql")),
    ("003_events.sql", include_str!("../../migrations/003_events.sql")),
    ("004_signature_cache.sql", include_str!("../../migrations/004_signature_cache.sql")),
    ("005_queue_messages.sql", include_str!("../../migrations/005_queue_messages.sql")),
];

pub async fn run(pool: &Pool) -> Result<(), DbError> {
    let client = pool.get().await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )",
            &[],
        )
        .await?;

    let rows = client.query("SELECT name FROM _migrations", &[]).await?;
    let applied: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
    drop(client);

    for (name, sql) in pending(&applied) {
        let mut client = pool.get().await?;
        let tx = client.transaction().await?;

        tx.batch_execute(sql).await.map_err(|e| {
            DbError::MigrationError(format!("Failed to run migration {}: {}", name, e))
        })?;

        tx.execute("INSERT INTO _migrations (name) VALUES ($1)", &[&name])
            .await?;

        tx.commit().await?;

        tracing::info!("Applied migration: {}", name);
    }

    tracing::info!("All migrations up to date");
    Ok(())
}

fn pending(applied: &HashSet<String>) -> Vec<(&'static str, &'static str)> {
    MIGRATIONS
        .iter()
        .filter(|(name, _)| !applied.contains(*name))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_sorted_by_name() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_pending_skips_applied() {
        let applied: HashSet<String> = ["001_endpoints.sql".to_string()].into_iter().collect();
        let names: Vec<&str> = pending(&applied).into_iter().map(|(n, _)| n).collect();
        assert!(!names.contains(&"001_endpoints.sql"));
        assert_eq!(names.len(), MIGRATIONS.len() - 1);
    }
}

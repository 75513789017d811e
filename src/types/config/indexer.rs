use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::queue::QueueNames;

pub const CONFIG_PATH_ENV_VAR: &str = "INDEXER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub range: RangeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default = "default_start_block")]
    pub start_block: u64,
    #[serde(default = "default_end_block")]
    pub end_block: u64,
    #[serde(default = "default_blocks_per_message")]
    pub blocks_per_message: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_max_endpoint_attempts")]
    pub max_endpoint_attempts: u32,
    #[serde(default = "default_endpoint_backoff_ms")]
    pub endpoint_backoff_ms: u64,
    #[serde(default = "default_stale_lease_secs")]
    pub stale_lease_secs: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Per-endpoint request ceiling; unlimited when absent.
    #[serde(default)]
    pub rpc_requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_main_queue")]
    pub main: String,
    #[serde(default = "default_retry_queue")]
    pub retry: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lookup_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}
fn default_start_block() -> u64 {
    18_000_000
}
fn default_end_block() -> u64 {
    18_001_000
}
fn default_blocks_per_message() -> u64 {
    100
}
fn default_instances() -> usize {
    5
}
fn default_max_endpoint_attempts() -> u32 {
    10
}
fn default_endpoint_backoff_ms() -> u64 {
    2_000
}
fn default_stale_lease_secs() -> u64 {
    3_600
}
fn default_rpc_timeout_ms() -> u64 {
    30_000
}
fn default_main_queue() -> String {
    QueueNames::default().main
}
fn default_retry_queue() -> String {
    QueueNames::default().retry
}
fn default_dead_letter_queue() -> String {
    QueueNames::default().dead_letter
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_api_url() -> String {
    "https://www.4byte.directory/api/v1/event-signatures/".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_lookup_timeout_ms() -> u64 {
    5_000
}
fn default_user_agent() -> String {
    concat!("block-range-indexer/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            range: RangeConfig::default(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            signatures: SignatureConfig::default(),
            database_url_env_var: default_database_url_env_var(),
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            start_block: default_start_block(),
            end_block: default_end_block(),
            blocks_per_message: default_blocks_per_message(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            max_endpoint_attempts: default_max_endpoint_attempts(),
            endpoint_backoff_ms: default_endpoint_backoff_ms(),
            stale_lease_secs: default_stale_lease_secs(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_requests_per_second: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            main: default_main_queue(),
            retry: default_retry_queue(),
            dead_letter: default_dead_letter_queue(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            max_attempts: default_max_attempts(),
            timeout_ms: default_lookup_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl WorkerConfig {
    pub fn endpoint_backoff(&self) -> Duration {
        Duration::from_millis(self.endpoint_backoff_ms)
    }

    pub fn stale_lease_age(&self) -> Duration {
        Duration::from_secs(self.stale_lease_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl QueueConfig {
    pub fn names(&self) -> QueueNames {
        QueueNames {
            main: self.main.clone(),
            retry: self.retry.clone(),
            dead_letter: self.dead_letter.clone(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SignatureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl IndexerConfig {
    /// Path from `INDEXER_CONFIG`, falling back to `config/config.json`.
    pub fn default_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Reads `path` (all defaults when it does not exist), then applies env
    /// overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::load_with(path, |key| env::var(key).ok())
    }

    /// [`load`](Self::load) with overrides taken from `lookup`.
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file at {}", path.display()))?;
            Self::from_json(&content)
                .with_context(|| format!("Failed to parse config file at {}", path.display()))?
        } else {
            tracing::warn!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Applies `START_BLOCK`, `END_BLOCK`, `BLOCKS_PER_MESSAGE`,
    /// `WORKER_INSTANCES`, `RETRY_DELAY_MS`, `MAX_RETRIES` and
    /// `FOURBYTE_API_URL` from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        override_parsed(&lookup, "START_BLOCK", &mut self.range.start_block)?;
        override_parsed(&lookup, "END_BLOCK", &mut self.range.end_block)?;
        override_parsed(&lookup, "BLOCKS_PER_MESSAGE", &mut self.range.blocks_per_message)?;
        override_parsed(&lookup, "WORKER_INSTANCES", &mut self.worker.instances)?;
        override_parsed(&lookup, "RETRY_DELAY_MS", &mut self.queue.retry_delay_ms)?;
        override_parsed(&lookup, "MAX_RETRIES", &mut self.queue.max_retries)?;
        if let Some(url) = lookup("FOURBYTE_API_URL") {
            self.signatures.api_url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.range.blocks_per_message > 0,
            "range.blocks_per_message must be positive"
        );
        anyhow::ensure!(self.worker.instances > 0, "worker.instances must be positive");
        anyhow::ensure!(
            self.signatures.max_attempts > 0,
            "signatures.max_attempts must be positive"
        );
        Ok(())
    }

    /// Database URL from the configured env var, loading `.env` if it is unset.
    pub fn database_url(&self) -> anyhow::Result<String> {
        if let Ok(url) = env::var(&self.database_url_env_var) {
            return Ok(url);
        }
        dotenvy::dotenv().with_context(|| {
            format!(
                "Missing env var {} and failed to load .env file",
                self.database_url_env_var
            )
        })?;
        env::var(&self.database_url_env_var).with_context(|| {
            format!(
                "Missing required env var after loading .env: {}",
                self.database_url_env_var
            )
        })
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = IndexerConfig::from_json("{}").unwrap();
        assert_eq!(config.range.start_block, 18_000_000);
        assert_eq!(config.range.blocks_per_message, 100);
        assert_eq!(config.worker.instances, 5);
        assert_eq!(config.worker.endpoint_backoff(), Duration::from_secs(2));
        assert_eq!(config.queue.names(), QueueNames::default());
        assert_eq!(config.queue.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.signatures.max_attempts, 3);
        assert_eq!(config.database_url_env_var, "DATABASE_URL");
        assert_eq!(config, IndexerConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = IndexerConfig::from_json(
            r#"{
                "range": { "start_block": 100, "end_block": 125, "blocks_per_message": 10 },
                "queue": { "main": "blocks", "max_retries": 1 },
                "worker": { "rpc_requests_per_second": 25 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.range.end_block, 125);
        assert_eq!(config.queue.main, "blocks");
        assert_eq!(config.queue.retry, "ethereum.blocks.retry.queue");
        assert_eq!(config.queue.max_retries, 1);
        assert_eq!(config.worker.rpc_requests_per_second, Some(25));
        assert_eq!(config.worker.max_endpoint_attempts, 10);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("START_BLOCK", "500"),
            ("END_BLOCK", "600"),
            ("WORKER_INSTANCES", "2"),
            ("MAX_RETRIES", " 7 "),
            ("FOURBYTE_API_URL", "http://localhost:9999/sigs"),
        ]
        .into_iter()
        .collect();
        let mut config = IndexerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.range.start_block, 500);
        assert_eq!(config.range.end_block, 600);
        assert_eq!(config.range.blocks_per_message, 100);
        assert_eq!(config.worker.instances, 2);
        assert_eq!(config.queue.max_retries, 7);
        assert_eq!(config.signatures.api_url, "http://localhost:9999/sigs");
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        let mut config = IndexerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "BLOCKS_PER_MESSAGE").then(|| "ten".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BLOCKS_PER_MESSAGE"));
    }

    #[test]
    fn test_validate_rejects_zero_unit_size() {
        let mut config = IndexerConfig::default();
        config.range.blocks_per_message = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = IndexerConfig::load_with(Path::new("does/not/exist.json"), |_| None).unwrap();
        assert_eq!(config, IndexerConfig::default());
    }

    #[test]
    fn test_load_applies_overrides_over_file() {
        let path = std::env::temp_dir().join(format!("indexer-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "range": { "start_block": 1, "end_block": 50 } }"#).unwrap();
        let config = IndexerConfig::load_with(&path, |key| {
            (key == "END_BLOCK").then(|| "99".to_string())
        });
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.range.start_block, 1);
        assert_eq!(config.range.end_block, 99);
    }

    #[test]
    fn test_load_rejects_invalid_override() {
        let err = IndexerConfig::load_with(Path::new("does/not/exist.json"), |key| {
            (key == "WORKER_INSTANCES").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("worker.instances"));
    }
}

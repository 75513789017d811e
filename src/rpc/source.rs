//! Upstream log source seam.
//!
//! The consumer only needs two calls from a chain node: the current height
//! (liveness probe) and a ranged `eth_getLogs`. Both are behind [`LogSource`]
//! so the pipeline can be driven against scripted sources.

use std::num::NonZeroU32;
use std::time::Duration;

use alloy::rpc::types::Log;
use async_trait::async_trait;
use url::Url;

use super::rpc::{RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, RpcError};

/// One log as returned by the provider, hex fields `0x`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    /// Seconds since the epoch, when the node includes it
    pub block_timestamp: Option<u64>,
}

impl RawLog {
    /// The primary topic identifies the event type; anonymous events have none.
    pub fn signature(&self) -> &str {
        self.topics.first().map(String::as_str).unwrap_or("")
    }
}

impl From<Log> for RawLog {
    fn from(log: Log) -> Self {
        Self {
            block_hash: log.block_hash.map(|h| format!("{:#x}", h)).unwrap_or_default(),
            block_number: log.block_number.unwrap_or_default(),
            transaction_hash: log
                .transaction_hash
                .map(|h| format!("{:#x}", h))
                .unwrap_or_default(),
            transaction_index: log.transaction_index.unwrap_or_default(),
            log_index: log.log_index.unwrap_or_default(),
            address: log.address().to_checksum(None),
            topics: log.topics().iter().map(|t| format!("{:#x}", t)).collect(),
            data: format!("0x{}", hex::encode(&log.data().data)),
            block_timestamp: log.block_timestamp,
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, RpcError>;

    /// All logs in `[from_block, to_block]`, in the order the node returns them.
    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, RpcError>;
}

/// Opens a log source for a leased endpoint. The returned source is the
/// per-unit connection state and is dropped when the unit finishes.
pub trait LogSourceFactory: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn LogSource>, RpcError>;
}

pub struct RpcLogSource {
    client: RpcClient,
}

impl RpcLogSource {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn current_height(&self) -> Result<u64, RpcError> {
        self.client.get_block_number().await
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, RpcError> {
        let logs = self.client.get_logs(from_block, to_block).await?;
        tracing::debug!(
            "Fetched {} logs for blocks {}-{} from {}",
            logs.len(),
            from_block,
            to_block,
            self.client.config().url
        );
        Ok(logs.into_iter().map(RawLog::from).collect())
    }
}

/// Builds alloy HTTP clients with a shared timeout, retry and rate-limit policy.
#[derive(Debug, Clone)]
pub struct RpcLogSourceFactory {
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub requests_per_second: Option<NonZeroU32>,
}

impl RpcLogSourceFactory {
    pub fn new(request_timeout: Duration, requests_per_second: Option<u32>) -> Self {
        Self {
            request_timeout,
            retry: RetryConfig::default(),
            requests_per_second: requests_per_second.and_then(NonZeroU32::new),
        }
    }
}

impl LogSourceFactory for RpcLogSourceFactory {
    fn connect(&self, url: &str) -> Result<Box<dyn LogSource>, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        let mut config = RpcClientConfig::new(url)
            .with_retry(self.retry.clone())
            .with_request_timeout(self.request_timeout);
        if let Some(rps) = self.requests_per_second {
            config = config.with_rate_limit(RateLimitConfig::per_second(rps));
        }
        Ok(Box::new(RpcLogSource::new(RpcClient::new(config)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256, Bytes, LogData};

    #[test]
    fn test_raw_log_from_rpc_log() {
        let topic0 = b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
        let inner = alloy::primitives::Log {
            address: address!("dac17f958d2ee523a2206206994597c13d831ec7"),
            data: LogData::new_unchecked(vec![topic0], Bytes::from(vec![0u8; 32])),
        };
        let log = Log {
            inner,
            block_hash: Some(b256!("0000000000000000000000000000000000000000000000000000000000000001")),
            block_number: Some(100),
            block_timestamp: Some(1_700_000_000),
            transaction_hash: None,
            transaction_index: Some(3),
            log_index: Some(7),
            removed: false,
        };

        let raw = RawLog::from(log);
        assert_eq!(raw.block_number, 100);
        assert_eq!(raw.log_index, 7);
        assert_eq!(raw.transaction_index, 3);
        assert_eq!(
            raw.signature(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(raw.data.len(), 2 + 64);
        assert_eq!(raw.transaction_hash, "");
        assert_eq!(raw.block_timestamp, Some(1_700_000_000));
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let factory = RpcLogSourceFactory::new(Duration::from_secs(1), None);
        assert!(matches!(factory.connect("not a url"), Err(RpcError::InvalidUrl(_))));
    }
}

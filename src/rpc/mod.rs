mod rpc;
mod source;

pub use rpc::{
    with_retry, RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, RpcError,
};
pub use source::{LogSource, LogSourceFactory, RawLog, RpcLogSource, RpcLogSourceFactory};

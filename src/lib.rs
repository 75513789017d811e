pub mod consumer;
pub mod db;
pub mod endpoints;
pub mod events;
pub mod maintenance;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod rpc;
pub mod signatures;
pub mod store;
pub mod types;

//! PostgreSQL access shared by every persistent store: pooled connections,
//! all-or-nothing batches and file-ordered migrations.

pub mod error;
pub mod migrations;
pub mod pool;
pub mod types;

pub use error::DbError;
pub use pool::DbPool;
pub use types::{DbOperation, DbValue, WhereClause};

//! Shared error type for the persistent-store seams and the in-process
//! implementation of every store trait.

mod memory;

pub use memory::MemoryStore;

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

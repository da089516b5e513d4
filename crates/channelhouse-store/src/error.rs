//! Store Error Types
//!
//! All store operations return `Result<T>`, aliased to
//! `Result<T, StoreError>`.
//!
//! ## Error Categories
//!
//! - **Transport**: `Connection` (store unreachable), `Closed` (handle closed
//!   locally)
//! - **Stream state**: `NoGroup`, `NoSuchKey`
//! - **Data**: `InvalidId`, `WrongType`
//! - **Backend**: `Backend` (anything else the store reported)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    Closed,

    #[error("No such key '{key}' or consumer group '{group}'")]
    NoGroup { key: String, group: String },

    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Invalid stream ID: {0}")]
    InvalidId(String),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("Store error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_connection_dropped() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

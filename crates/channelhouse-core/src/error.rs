//! Error types for the core crate

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid shards: {0}, allowed values are 32 or 64")]
    InvalidSlots(u32),

    #[error("Envelope error: {0}")]
    Envelope(#[from] serde_json::Error),
}

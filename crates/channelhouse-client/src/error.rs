//! Channel Error Types
//!
//! This module defines the errors surfaced by the [`Channels`](crate::Channels)
//! facade and its components.
//!
//! ## Error Categories
//!
//! - **Caller errors**: `InvalidTunnel` (the tunnel lacks the fields the
//!   operation needs; no store call is attempted), `Config` (invalid settings
//!   at construction), `Closed` (the facade was cleaned up)
//! - **Directory errors**: `Directory` (resolving or releasing a group failed)
//! - **Lifecycle errors**: `Lifecycle` (subscribe failed; the store error is
//!   passed through untouched so its diagnostics survive)
//! - **Operation errors**: `Produce`, `Consume`, `Unsubscribe`, `Delete`, each
//!   naming what it was working on and wrapping the store cause
//!
//! Best-effort teardown never produces an error: see
//! [`LifecycleManager::teardown`](crate::lifecycle::LifecycleManager::teardown).

use channelhouse_core::CoreError;
use channelhouse_store::StoreError;
use thiserror::Error;

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The tunnel lacks a field required by the operation.
    #[error("Invalid tunnel: {0}")]
    InvalidTunnel(String),

    /// Invalid configuration, detected at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resolving or releasing a group failed.
    #[error("Directory error for group '{group}' (sharded: {sharded}): {source}")]
    Directory {
        group: String,
        sharded: bool,
        #[source]
        source: DirectoryError,
    },

    /// Subscribing failed; the store error is passed through.
    #[error(transparent)]
    Lifecycle(#[from] StoreError),

    /// Appending a message failed.
    #[error("Failed to produce to '{key}': {source}")]
    Produce {
        key: String,
        #[source]
        source: StoreError,
    },

    /// A consume session failed while reading.
    #[error("Consume failed on '{key}' for consumer '{consumer}': {source}")]
    Consume {
        key: String,
        consumer: String,
        #[source]
        source: StoreError,
    },

    /// Publishing an unsubscribe request failed.
    #[error("Failed to unsubscribe consumer '{consumer}' from '{key}': {source}")]
    Unsubscribe {
        key: String,
        consumer: String,
        #[source]
        source: StoreError,
    },

    /// Deleting a group failed before its stream was released.
    #[error("Failed to delete group '{group}': {source}")]
    Delete {
        group: String,
        #[source]
        source: Box<ChannelError>,
    },

    /// Encoding a control envelope failed.
    #[error(transparent)]
    Envelope(#[from] CoreError),

    /// The facade was cleaned up; no further operations are accepted.
    #[error("Channels closed")]
    Closed,
}

/// Errors of the shard directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A sharded group has no stream key mapped.
    #[error("Group is not mapped to a stream")]
    UnknownGroup,

    /// A mapped stream key carries no `[n]` shard suffix.
    #[error("Stream key '{0}' has no shard suffix")]
    MalformedKey(String),

    /// A shard index member is not a shard of the configured table.
    #[error("Invalid shard index member: {0}")]
    InvalidShard(String),
}

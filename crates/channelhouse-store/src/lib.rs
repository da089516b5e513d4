//! Channelhouse Store - the Stream Store Seam
//!
//! The channels layer runs on top of an append-only, consumer-group-capable
//! log store. This crate describes the primitives it needs as the
//! [`StreamStore`] trait and ships two implementations:
//!
//! - [`MemoryStore`]: in-process, with the same stream semantics as a Redis
//!   server (entry IDs, `$` and `>` positions, NOACK group reads, blocking
//!   reads woken by writes). Used by tests, demos and single-process setups.
//! - `RedisStore` (feature `redis`): a Redis server or cluster.
//!
//! ## Connections
//!
//! A `StreamStore` value is one *connection*. Blocking reads hold their
//! connection until data arrives or the block timeout expires, so callers
//! open a dedicated connection per blocking reader with
//! [`StreamStore::duplicate`] and keep a shared connection for everything
//! else.
//!
//! ```text
//! shared connection ──► append, hash/sorted-set ops, group admin, delete-entry
//! duplicate #1      ──► blocking read of consumer "a"
//! duplicate #2      ──► blocking read of consumer "b"
//! ```

pub mod error;
pub mod id;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use error::{Result, StoreError};
pub use id::EntryId;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Read position meaning "entries appended after this call".
pub const POSITION_NEW: &str = "$";

/// Group read position meaning "never delivered to any consumer of the group".
pub const POSITION_UNDELIVERED: &str = ">";

/// One stream entry with its field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, Bytes)>,
}

/// Summary of a consumer group, as listed by [`StreamStore::list_groups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub last_delivered_id: String,
}

/// Options of a blocking consumer-group read.
#[derive(Debug, Clone, Copy)]
pub struct GroupReadOptions {
    /// Maximum number of entries returned.
    pub count: usize,
    /// Maximum time to block; zero blocks until data arrives.
    pub block: Duration,
    /// Skip the pending-entries list; entries count as delivered once read.
    pub no_ack: bool,
}

/// Bound of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(i64),
}

/// Sorted-set member with its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub member: String,
    pub score: i64,
}

impl ScoreBound {
    pub fn admits_from_below(self, score: i64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(min) => score >= min,
        }
    }

    pub fn admits_from_above(self, score: i64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(max) => score <= max,
        }
    }
}

/// Primitives required from the stream store.
///
/// Implementations must be safe to share across tasks. Every method is a
/// single store command; there are no multi-command transactions.
#[async_trait]
pub trait StreamStore: Send + Sync {
    // ============================================================
    // STREAM OPERATIONS
    // ============================================================

    /// Appends one entry, creating the stream if needed.
    ///
    /// With `cap` set, the stream is trimmed to roughly `cap` entries. The
    /// trim is approximate: a store may keep somewhat more for efficiency.
    ///
    /// Returns the store-assigned entry ID.
    async fn append(&self, key: &str, cap: Option<usize>, field: &str, value: &[u8])
        -> Result<String>;

    /// Reads entries with an ID greater than `after`, blocking up to `block`.
    ///
    /// `after` may be [`POSITION_NEW`]. A missing stream is not an error: the
    /// read waits for it to appear. An empty result means the block expired.
    async fn read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Reads as `consumer` of `group`, blocking up to `options.block`.
    ///
    /// `from` is [`POSITION_UNDELIVERED`] for new entries or an explicit ID
    /// for the consumer's pending history. The consumer is created in the
    /// group on first read.
    ///
    /// # Errors
    ///
    /// - `NoGroup`: the stream or the group does not exist, or vanished while
    ///   the read was blocked
    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        from: &str,
        options: GroupReadOptions,
    ) -> Result<Vec<StreamEntry>>;

    /// Creates a consumer group starting at `start` (an ID or `$`).
    ///
    /// Returns `false` when the group already exists.
    ///
    /// # Errors
    ///
    /// - `NoSuchKey`: the stream is missing and `make_stream` is false
    async fn create_group(&self, key: &str, group: &str, start: &str, make_stream: bool)
        -> Result<bool>;

    /// Deletes one entry. Returns the number of entries removed.
    async fn delete_entry(&self, key: &str, id: &str) -> Result<u64>;

    /// Removes a consumer from a group. Returns its pending entry count.
    async fn remove_consumer(&self, key: &str, group: &str, consumer: &str) -> Result<u64>;

    /// Lists the consumer groups of a stream.
    ///
    /// # Errors
    ///
    /// - `NoSuchKey`: the stream does not exist
    async fn list_groups(&self, key: &str) -> Result<Vec<GroupInfo>>;

    /// Destroys a consumer group. Returns `false` when it did not exist.
    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool>;

    // ============================================================
    // KEY OPERATIONS
    // ============================================================

    /// Deletes a key of any kind. Returns `false` when it did not exist.
    async fn delete_key(&self, key: &str) -> Result<bool>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    // ============================================================
    // HASH OPERATIONS
    // ============================================================

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Returns `false` when the field did not exist.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    // ============================================================
    // SORTED SET OPERATIONS
    // ============================================================

    /// Members with `min <= score <= max`, lowest score first.
    ///
    /// Members with equal scores are ordered lexicographically. `limit` is an
    /// `(offset, count)` window over the ordered result.
    async fn range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(usize, usize)>,
    ) -> Result<Vec<ScoredMember>>;

    /// Adds `delta` to a member's score, creating it at 0 first if needed.
    ///
    /// Returns the new score.
    async fn increment_score(&self, key: &str, delta: i64, member: &str) -> Result<i64>;

    // ============================================================
    // CONNECTION LIFECYCLE
    // ============================================================

    /// Opens a new connection to the same store.
    async fn duplicate(&self) -> Result<Arc<dyn StreamStore>>;

    /// Closes this connection. Blocked reads on it fail with `Closed`.
    async fn close(&self) -> Result<()>;
}

//! Channelhouse Core - Shared Types for Pre-Sharded Channels
//!
//! This crate holds the pure, store-independent pieces of the channels layer:
//!
//! - **Key addressing**: how stream keys, the group lookup hash and the shard
//!   load index are named inside the store ([`KeySpace`])
//! - **Shard tags**: the fixed 32/64 hash-slot tags used to spread streams
//!   evenly over a clustered store ([`SlotCount`])
//! - **Control envelopes**: the JSON field name carried by every stream entry
//!   ([`ControlEnvelope`])
//! - **Configuration**: [`ChannelsConfig`] and the store connection target
//!
//! ## Key Layout
//!
//! ```text
//! prefix        = <application>-<schema>-<version>
//!
//! non-sharded   = <prefix>|<group>
//! sharded       = <prefix>|{tag}<group>[<shard>]
//! group map     = <prefix>#keys{tag0}[0]
//! shard index   = <prefix>:shards{tag0}[0]
//! ```
//!
//! Nothing in this crate talks to the network; see `channelhouse-store` for the
//! store seam and `channelhouse-client` for the channels themselves.

pub mod config;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod shards;

pub use config::{ChannelsConfig, StoreTarget};
pub use envelope::{ControlEnvelope, UnsubscribeTarget, DEFAULT_ORIGIN_TYPE};
pub use error::{CoreError, Result};
pub use keys::{shard_of, KeySpace};
pub use shards::SlotCount;

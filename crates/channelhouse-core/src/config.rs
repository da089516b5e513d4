//! Channels Configuration
//!
//! ## ChannelsConfig
//!
//! - **application / schema / version**: compose the key prefix
//!   (default `app-channels-1`)
//! - **sharded**: spread groups over the hash-slot shards (default: false)
//! - **slots**: number of shards, 32 or 64 (default: 32)
//! - **overflow**: approximate maximum entries kept per stream (default: 100)
//! - **unsubscribe_grace_ms**: how long `delete` waits for local consumers to
//!   observe their unsubscribe request (default: 2000)
//! - **store**: where the stream store lives
//!
//! ## Usage
//!
//! ```ignore
//! use channelhouse_core::{ChannelsConfig, StoreTarget};
//!
//! let config = ChannelsConfig {
//!     application: "hearing".to_string(),
//!     sharded: true,
//!     store: StoreTarget::Nodes(vec!["redis://10.0.0.1:7000".to_string()]),
//!     ..Default::default()
//! };
//! let slots = config.slot_count()?;
//! ```

use crate::error::Result;
use crate::keys::KeySpace;
use crate::shards::SlotCount;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Application name, first prefix part (default: "app")
    #[serde(default = "default_application")]
    pub application: String,

    /// Schema name, second prefix part (default: "channels")
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Schema version, third prefix part (default: 1)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Use pre-sharded stream keys (default: false)
    #[serde(default)]
    pub sharded: bool,

    /// Number of shards, 32 or 64 (default: 32)
    #[serde(default = "default_slots")]
    pub slots: u32,

    /// Approximate stream length cap (default: 100)
    #[serde(default = "default_overflow")]
    pub overflow: usize,

    /// Wait bound for local consumers during group deletion (default: 2s)
    #[serde(default = "default_unsubscribe_grace_ms")]
    pub unsubscribe_grace_ms: u64,

    /// Store connection target
    #[serde(default)]
    pub store: StoreTarget,
}

/// Where the stream store is reached.
///
/// A node list implies a clustered store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTarget {
    /// Single endpoint, e.g. `redis://127.0.0.1:6379`
    Url(String),
    /// Cluster seed nodes
    Nodes(Vec<String>),
}

fn default_application() -> String {
    "app".to_string()
}

fn default_schema() -> String {
    "channels".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_slots() -> u32 {
    32
}

fn default_overflow() -> usize {
    100
}

fn default_unsubscribe_grace_ms() -> u64 {
    2000
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
            schema: default_schema(),
            version: default_version(),
            sharded: false,
            slots: default_slots(),
            overflow: default_overflow(),
            unsubscribe_grace_ms: default_unsubscribe_grace_ms(),
            store: StoreTarget::default(),
        }
    }
}

impl Default for StoreTarget {
    fn default() -> Self {
        StoreTarget::Url("redis://127.0.0.1:6379".to_string())
    }
}

impl ChannelsConfig {
    /// Validated shard count.
    ///
    /// # Errors
    ///
    /// `InvalidSlots` for anything other than 32 or 64.
    pub fn slot_count(&self) -> Result<SlotCount> {
        SlotCount::try_from(self.slots)
    }

    /// Key builder for this configuration.
    pub fn key_space(&self) -> Result<KeySpace> {
        Ok(KeySpace::new(
            &self.application,
            &self.schema,
            self.version,
            self.slot_count()?,
        ))
    }

    pub fn unsubscribe_grace(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_defaults() {
        let config = ChannelsConfig::default();
        assert_eq!(config.key_space().unwrap().prefix(), "app-channels-1");
        assert!(!config.sharded);
        assert_eq!(config.slot_count().unwrap(), SlotCount::S32);
        assert_eq!(config.overflow, 100);
        assert_eq!(config.unsubscribe_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_slots() {
        let config = ChannelsConfig {
            slots: 48,
            ..Default::default()
        };
        assert!(matches!(config.slot_count(), Err(CoreError::InvalidSlots(48))));
        assert!(config.key_space().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ChannelsConfig = serde_json::from_str(
            r#"{"application":"test","sharded":true,"slots":64,"store":{"nodes":["redis://a:7000","redis://b:7000"]}}"#,
        )
        .unwrap();

        assert_eq!(config.application, "test");
        assert_eq!(config.schema, "channels");
        assert_eq!(config.version, 1);
        assert!(config.sharded);
        assert_eq!(config.slot_count().unwrap(), SlotCount::S64);
        assert_eq!(
            config.store,
            StoreTarget::Nodes(vec!["redis://a:7000".into(), "redis://b:7000".into()])
        );
    }
}

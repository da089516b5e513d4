//! Channelhouse Client - Pre-sharded Channels over a Stream Store
//!
//! Producers and consumers address a logical *group*; this crate maps it
//! onto a physical stream key of a consumer-group-capable stream store,
//! spreading groups evenly over the store's hash slots when sharding is on.
//! Consumers cooperate in *teams* where every message goes to exactly one
//! member, and leave their team through an in-band unsubscribe protocol.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌──────────────────────────────┐
//!                         │           Channels           │
//!                         │ use_group subscribe produce  │
//!                         │ consume unsubscribe delete   │
//!                         └──────┬──────────┬──────┬─────┘
//!              ┌─────────────────┘          │      └──────────────┐
//!              ▼                            ▼                     ▼
//!     ┌─────────────────┐      ┌──────────────────────┐   ┌───────────────┐
//!     │ ShardDirectory  │      │  LifecycleManager    │   │ ConsumeEngine │
//!     │ group -> key    │◄─────│  groups, consumers   │◄──│ session tasks │
//!     │ shard load      │      │  consumer registry   │   │               │
//!     └────────┬────────┘      └──────────┬───────────┘   └──────┬────────┘
//!              │    shared connection     │                      │ dedicated
//!              ▼                          ▼                      ▼ connections
//!     ┌────────────────────────────────────────────────────────────────────┐
//!     │                         StreamStore                                │
//!     └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocking reads only ever run on a consumer's dedicated connection; every
//! short request (resolve, produce, control-entry cleanup, teardown) uses the
//! shared one.
//!
//! ## Quick Start
//!
//! ```ignore
//! use channelhouse_client::{Channels, ConsumeOptions};
//! use channelhouse_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let channels = Channels::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let mut tunnel = channels.use_group("events").await?;
//! channels.subscribe(&mut tunnel, None, None).await?;
//! channels.produce(&tunnel, "hello").await?;
//!
//! let mut consumption = channels.consume(&tunnel, ConsumeOptions::default()).await?;
//! let batch = consumption.next_batch().await;
//! ```

pub mod channels;
pub mod consume;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod producer;
pub mod registry;
pub mod tunnel;

pub use channels::{Channels, ChannelsBuilder};
pub use consume::{ConsumeEngine, ConsumeOptions, Consumption};
pub use directory::ShardDirectory;
pub use error::{ChannelError, DirectoryError, Result};
pub use lifecycle::{generate_consumer_id, LifecycleManager};
pub use producer::Producer;
pub use registry::{ConsumerSlot, LocalConsumerRegistry};
pub use tunnel::{ConnectionHandle, Message, Tunnel, TunnelMode};

pub use channelhouse_core::{ChannelsConfig, StoreTarget};

//! Channels Facade
//!
//! [`Channels`] is the public surface composing the shard directory, the
//! lifecycle manager, the producer and the consume engine over one shared
//! store connection.
//!
//! ## Example
//!
//! ```ignore
//! use channelhouse_client::{Channels, ConsumeOptions};
//! use channelhouse_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let channels = Channels::builder()
//!     .application("shop")
//!     .sharded(true)
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let mut tunnel = channels.use_group("orders").await?;
//! channels.subscribe(&mut tunnel, Some("billing"), None).await?;
//! channels.produce(&tunnel, b"order-1").await?;
//!
//! let mut consumption = channels.consume(&tunnel, ConsumeOptions::default()).await?;
//! while let Some(batch) = consumption.next_batch().await {
//!     for message in batch? {
//!         println!("{:?}", message);
//!     }
//! }
//!
//! channels.cleanup().await?;
//! ```
//!
//! ## Shutdown
//!
//! [`Channels::cleanup`] retires every local consumer and closes the shared
//! connection. Afterwards every operation fails with `Closed`.

use crate::consume::{ConsumeEngine, ConsumeOptions, Consumption};
use crate::directory::ShardDirectory;
use crate::error::{ChannelError, Result};
use crate::lifecycle::LifecycleManager;
use crate::producer::Producer;
use crate::registry::LocalConsumerRegistry;
use crate::tunnel::Tunnel;
use channelhouse_core::{ChannelsConfig, DEFAULT_ORIGIN_TYPE};
use channelhouse_store::StreamStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Pre-sharded publish/subscribe channels over a stream store.
pub struct Channels {
    config: ChannelsConfig,
    directory: Arc<ShardDirectory>,
    registry: Arc<LocalConsumerRegistry>,
    lifecycle: Arc<LifecycleManager>,
    producer: Producer,
    engine: ConsumeEngine,
    closed: AtomicBool,
}

impl Channels {
    /// Creates a builder with default settings.
    pub fn builder() -> ChannelsBuilder {
        ChannelsBuilder::new()
    }

    /// Creates channels from a configuration and the shared store connection.
    ///
    /// # Errors
    ///
    /// - `Config`: the slot count is neither 32 nor 64
    pub fn new(config: ChannelsConfig, store: Arc<dyn StreamStore>) -> Result<Self> {
        let keys = config
            .key_space()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        let registry = Arc::new(LocalConsumerRegistry::new());
        let directory = Arc::new(ShardDirectory::new(
            Arc::clone(&store),
            keys.clone(),
            config.sharded,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&registry),
            config.overflow,
            config.unsubscribe_grace(),
        ));
        let producer = Producer::new(Arc::clone(&store), config.overflow);
        let engine = ConsumeEngine::new(store, Arc::clone(&registry), Arc::clone(&lifecycle));

        info!(
            prefix = %keys.prefix(),
            sharded = config.sharded,
            slots = config.slots,
            overflow = config.overflow,
            "Channels initialized"
        );

        Ok(Self {
            config,
            directory,
            registry,
            lifecycle,
            producer,
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens the store named by `config.store` and creates channels over it.
    #[cfg(feature = "redis")]
    pub async fn connect(config: ChannelsConfig) -> Result<Self> {
        use channelhouse_core::StoreTarget;
        use channelhouse_store::RedisStore;

        let store = match &config.store {
            StoreTarget::Url(url) => RedisStore::open_url(url).await?,
            StoreTarget::Nodes(nodes) => RedisStore::open_cluster(nodes).await?,
        };
        Self::new(config, Arc::new(store))
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    pub fn directory(&self) -> &ShardDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &LocalConsumerRegistry {
        &self.registry
    }

    /// Resolves a group to a tunnel on its stream.
    pub async fn use_group(&self, group: &str) -> Result<Tunnel> {
        self.check_open()?;
        let key = self
            .directory
            .resolve(group)
            .await
            .map_err(|source| self.lifecycle.directory_error(group, source));
        report("use", key).map(Tunnel::new)
    }

    /// Subscribes a consumer through the tunnel.
    ///
    /// Without `team` the consumer reads every message on its own (solo
    /// mode). Without `consumer` an id is generated.
    pub async fn subscribe(
        &self,
        tunnel: &mut Tunnel,
        team: Option<&str>,
        consumer: Option<&str>,
    ) -> Result<()> {
        self.check_open()?;
        report(
            "subscribe",
            self.lifecycle.subscribe(tunnel, team, consumer).await,
        )
    }

    /// Asks the tunnel's consumer to leave; its consume session ends once it
    /// reads the request.
    pub async fn unsubscribe(&self, tunnel: &Tunnel) -> Result<()> {
        self.check_open()?;
        report("unsubscribe", self.lifecycle.unsubscribe(tunnel).await)
    }

    /// Produces a message of the default type `all`.
    pub async fn produce(&self, tunnel: &Tunnel, message: impl AsRef<[u8]>) -> Result<String> {
        self.produce_typed(tunnel, message, DEFAULT_ORIGIN_TYPE).await
    }

    /// Produces a message of the given type.
    pub async fn produce_typed(
        &self,
        tunnel: &Tunnel,
        message: impl AsRef<[u8]>,
        kind: &str,
    ) -> Result<String> {
        self.check_open()?;
        report(
            "produce",
            self.producer.produce(tunnel, message.as_ref(), kind).await,
        )
    }

    /// Starts consuming batches for the tunnel's consumer.
    pub async fn consume(&self, tunnel: &Tunnel, options: ConsumeOptions) -> Result<Consumption> {
        self.check_open()?;
        report("consume", self.engine.consume(tunnel, options).await)
    }

    /// Unsubscribes the group's local consumers and deletes its stream.
    pub async fn delete_group(&self, group: &str) -> Result<()> {
        self.check_open()?;
        report("delete", self.lifecycle.delete(group).await)
    }

    /// Retires every local consumer and closes the shared connection.
    ///
    /// Calling it again is a no-op.
    pub async fn cleanup(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        report("cleanup", self.lifecycle.cleanup().await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

fn report<T>(operation: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!(operation, error = %e, "Channel operation failed");
    }
    result
}

/// Builder for [`Channels`].
pub struct ChannelsBuilder {
    config: ChannelsConfig,
    store: Option<Arc<dyn StreamStore>>,
}

impl ChannelsBuilder {
    pub fn new() -> Self {
        Self {
            config: ChannelsConfig::default(),
            store: None,
        }
    }

    /// Starts from an existing configuration.
    pub fn config(mut self, config: ChannelsConfig) -> Self {
        self.config = config;
        self
    }

    /// Application name, first part of the key prefix (default: "app").
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.config.application = application.into();
        self
    }

    /// Schema name, second part of the key prefix (default: "channels").
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = schema.into();
        self
    }

    /// Schema version, last part of the key prefix (default: 1).
    pub fn version(mut self, version: u32) -> Self {
        self.config.version = version;
        self
    }

    /// Spread groups over shard tags (default: false).
    pub fn sharded(mut self, sharded: bool) -> Self {
        self.config.sharded = sharded;
        self
    }

    /// Number of shard tags, 32 or 64 (default: 32).
    pub fn slots(mut self, slots: u32) -> Self {
        self.config.slots = slots;
        self
    }

    /// Approximate per-stream entry cap (default: 100).
    pub fn overflow(mut self, overflow: usize) -> Self {
        self.config.overflow = overflow;
        self
    }

    /// How long `delete_group` waits for consuming sessions to retire
    /// (default: 2s).
    pub fn unsubscribe_grace(mut self, grace: Duration) -> Self {
        self.config.unsubscribe_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Shared store connection (required by [`build`](Self::build)).
    pub fn store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds channels over the configured store connection.
    pub fn build(self) -> Result<Channels> {
        let store = self
            .store
            .ok_or_else(|| ChannelError::Config("store is required".to_string()))?;
        Channels::new(self.config, store)
    }

    /// Opens the configured store target and builds channels over it.
    #[cfg(feature = "redis")]
    pub async fn connect(self) -> Result<Channels> {
        match self.store {
            Some(store) => Channels::new(self.config, store),
            None => Channels::connect(self.config).await,
        }
    }
}

impl Default for ChannelsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

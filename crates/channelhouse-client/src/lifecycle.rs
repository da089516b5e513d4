//! Lifecycle Manager - Consumer Groups and Consumers
//!
//! Creates and removes the store-side consumer groups and consumers behind
//! tunnels, and keeps the [`LocalConsumerRegistry`] in step with them.
//!
//! ## Tunnel States
//!
//! ```text
//!            subscribe                 unsubscribe
//! Unbound ─────────────► Subscribed ─────────────────► Unsubscribing
//!    ▲                                                      │
//!    └──────────── own unsubscribe entry consumed ──────────┘
//!                  (teardown, connection closed)
//! ```
//!
//! `unsubscribe` only *requests* removal by publishing a control entry on the
//! stream. Whichever reader of the team sees it either honors it (its own) or
//! passes it on (a teammate's); see [`crate::consume`].
//!
//! ## Modes
//!
//! A consumer subscribed with a team name competes with its teammates for
//! messages through the team's consumer group. Without a team name the
//! consumer is its own team (solo mode) and reads every message with its own
//! cursor, starting where its group was when it subscribed.

use crate::directory::ShardDirectory;
use crate::error::{ChannelError, DirectoryError, Result};
use crate::registry::{ConsumerSlot, LocalConsumerRegistry};
use crate::tunnel::{ConnectionHandle, Tunnel, TunnelMode};
use channelhouse_core::ControlEnvelope;
use channelhouse_store::{StoreError, StreamStore, POSITION_NEW};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generates an opaque consumer id: a v4 UUID without hyphens.
pub fn generate_consumer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Manages consumer groups, consumers and their local registrations.
pub struct LifecycleManager {
    store: Arc<dyn StreamStore>,
    directory: Arc<ShardDirectory>,
    registry: Arc<LocalConsumerRegistry>,
    overflow: usize,
    grace: Duration,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn StreamStore>,
        directory: Arc<ShardDirectory>,
        registry: Arc<LocalConsumerRegistry>,
        overflow: usize,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            overflow,
            grace,
        }
    }

    pub fn registry(&self) -> &Arc<LocalConsumerRegistry> {
        &self.registry
    }

    /// Binds a consumer to the tunnel's stream.
    ///
    /// Creates the stream and the team's consumer group if needed and opens
    /// the consumer's dedicated connection on first subscribe. Subscribing an
    /// already registered consumer again reuses its connection.
    ///
    /// # Errors
    ///
    /// - `InvalidTunnel`: empty stream key, or the consumer is registered on
    ///   another stream or team
    /// - `Lifecycle`: any store failure, passed through
    pub async fn subscribe(
        &self,
        tunnel: &mut Tunnel,
        team: Option<&str>,
        consumer: Option<&str>,
    ) -> Result<()> {
        if tunnel.key().is_empty() {
            return Err(ChannelError::InvalidTunnel(
                "subscribe requires a stream key".to_string(),
            ));
        }

        let key = tunnel.key().to_string();
        let consumer = consumer.map_or_else(generate_consumer_id, str::to_string);
        let (team, mode) = match team {
            Some(team) => (team.to_string(), TunnelMode::Team),
            None => (consumer.clone(), TunnelMode::Solo),
        };

        let _gate = self.registry.gate(&consumer).await;

        let existing = self.registry.get(&consumer).await;
        if let Some(slot) = &existing {
            if slot.key() != key || slot.team() != team {
                return Err(ChannelError::InvalidTunnel(format!(
                    "consumer '{}' is already subscribed to '{}' in team '{}'",
                    consumer,
                    slot.key(),
                    slot.team()
                )));
            }
        }

        let created = self.store.create_group(&key, &team, POSITION_NEW, true).await?;
        if created {
            // Leftovers of an earlier process using the same consumer id.
            match self.store.remove_consumer(&key, &team, &consumer).await {
                Ok(_) | Err(StoreError::NoGroup { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            debug!(key = %key, team = %team, "Created consumer group");
        }

        let connection = match existing {
            Some(slot) => slot.connection().clone(),
            None => {
                let connection = ConnectionHandle::new(self.store.duplicate().await?);
                let cursor = match mode {
                    TunnelMode::Solo => self.group_position(&key, &team).await?,
                    TunnelMode::Team => POSITION_NEW.to_string(),
                };

                let mut registered = Tunnel::new(key.clone());
                registered.bind(consumer.clone(), team.clone(), mode, connection.clone());
                self.registry
                    .insert(Arc::new(ConsumerSlot::new(
                        registered,
                        connection.clone(),
                        cursor,
                    )))
                    .await;
                connection
            }
        };

        tunnel.bind(consumer.clone(), team.clone(), mode, connection);
        info!(
            key = %key,
            team = %team,
            consumer = %consumer,
            mode = ?mode,
            "Subscribed consumer"
        );
        Ok(())
    }

    /// Last delivered id of a group, the starting point of a solo cursor.
    async fn group_position(&self, key: &str, group: &str) -> Result<String> {
        let position = self
            .store
            .list_groups(key)
            .await?
            .into_iter()
            .find(|info| info.name == group)
            .map(|info| info.last_delivered_id);
        Ok(position.unwrap_or_else(|| POSITION_NEW.to_string()))
    }

    /// Requests the tunnel's consumer to leave its team.
    ///
    /// # Errors
    ///
    /// - `InvalidTunnel`: the tunnel has no stream key, team or consumer
    /// - `Unsubscribe`: the control entry could not be appended
    pub async fn unsubscribe(&self, tunnel: &Tunnel) -> Result<()> {
        let (Some(team), Some(consumer)) = (tunnel.team(), tunnel.consumer()) else {
            return Err(ChannelError::InvalidTunnel(
                "unsubscribe requires a team and a consumer".to_string(),
            ));
        };
        if tunnel.key().is_empty() {
            return Err(ChannelError::InvalidTunnel(
                "unsubscribe requires a stream key".to_string(),
            ));
        }
        self.publish_unsubscribe(tunnel.key(), team, consumer).await?;
        Ok(())
    }

    /// Appends an unsubscribe control entry addressed to `team`/`consumer`.
    pub(crate) async fn publish_unsubscribe(
        &self,
        key: &str,
        team: &str,
        consumer: &str,
    ) -> Result<String> {
        let field = ControlEnvelope::unsubscribe(team, consumer).encode()?;
        let id = self
            .store
            .append(key, Some(self.overflow), &field, &[])
            .await
            .map_err(|source| ChannelError::Unsubscribe {
                key: key.to_string(),
                consumer: consumer.to_string(),
                source,
            })?;
        debug!(key = %key, team = %team, consumer = %consumer, id = %id, "Published unsubscribe");
        Ok(id)
    }

    /// Removes a consumer from its group, destroying the group once empty.
    ///
    /// Without `force` this is skipped for a consumer this process has
    /// already retired.
    pub async fn teardown(
        &self,
        key: &str,
        team: &str,
        consumer: &str,
        force: bool,
    ) -> std::result::Result<(), StoreError> {
        if !force && self.registry.is_retired(consumer).await {
            debug!(key = %key, consumer = %consumer, "Consumer already torn down");
            return Ok(());
        }

        self.store.remove_consumer(key, team, consumer).await?;
        let remaining = self
            .store
            .list_groups(key)
            .await?
            .into_iter()
            .find(|group| group.name == team)
            .map(|group| group.consumers);

        if remaining == Some(0) {
            self.store.destroy_group(key, team).await?;
            debug!(key = %key, team = %team, "Destroyed empty consumer group");
        }
        Ok(())
    }

    /// Tears a consumer down, closes its connection and drops it from the
    /// registry.
    pub(crate) async fn retire(&self, slot: &ConsumerSlot, force: bool) {
        let _gate = self.registry.gate(slot.consumer()).await;
        let already_retired = slot.is_retired();
        slot.mark_retired();

        let teardown = if already_retired && !force {
            Ok(())
        } else {
            self.teardown(slot.key(), slot.team(), slot.consumer(), force)
                .await
        };
        self.registry.retire(slot).await;
        let closed = slot.connection().store().close().await;

        // Group and consumer removal is advisory; the only place its errors
        // are dropped.
        if let Err(e) = teardown.and(closed) {
            warn!(
                key = %slot.key(),
                consumer = %slot.consumer(),
                error = %e,
                "Consumer teardown incomplete"
            );
        }
        info!(key = %slot.key(), consumer = %slot.consumer(), "Retired consumer");
    }

    /// Unsubscribes every local consumer of the group, then releases it.
    ///
    /// Consumers with a running consume session get up to the unsubscribe
    /// grace to observe their unsubscribe entry and retire. Whatever is still
    /// registered on the stream afterwards is retired with force, which ends
    /// its session quietly.
    pub async fn delete(&self, group: &str) -> Result<()> {
        let key = self
            .directory
            .lookup(group)
            .await
            .map_err(|source| self.directory_error(group, source))?;

        if let Some(key) = &key {
            let slots = self.registry.on_stream(key).await;
            for slot in &slots {
                self.publish_unsubscribe(key, slot.team(), slot.consumer())
                    .await
                    .map_err(|e| ChannelError::Delete {
                        group: group.to_string(),
                        source: Box::new(e),
                    })?;
            }

            let active: Vec<_> = slots.iter().filter(|s| s.session_active()).collect();
            if !active.is_empty() {
                let idle = join_all(active.iter().map(|slot| slot.wait_idle()));
                if tokio::time::timeout(self.grace, idle).await.is_err() {
                    warn!(
                        group = %group,
                        key = %key,
                        grace_ms = self.grace.as_millis() as u64,
                        "Consumers did not retire within the unsubscribe grace"
                    );
                }
            }

            for slot in self.registry.on_stream(key).await {
                self.retire(&slot, true).await;
            }
        }

        self.directory
            .release(group)
            .await
            .map_err(|source| self.directory_error(group, source))?;
        if let Some(key) = &key {
            self.registry.forget_stream(key).await;
        }
        info!(group = %group, "Deleted group");
        Ok(())
    }

    /// Force-retires every registered consumer and closes the shared
    /// connection.
    pub async fn cleanup(&self) -> Result<()> {
        for slot in self.registry.all().await {
            self.retire(&slot, true).await;
        }
        self.registry.forget_all().await;
        self.store.close().await?;
        info!("Closed channels");
        Ok(())
    }

    pub(crate) fn directory_error(
        &self,
        group: &str,
        source: DirectoryError,
    ) -> ChannelError {
        ChannelError::Directory {
            group: group.to_string(),
            sharded: self.directory.is_sharded(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_consumer_id() {
        let id = generate_consumer_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, generate_consumer_id());
    }
}

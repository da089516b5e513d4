//! Consume Engine - Blocking Reads and the Unsubscribe Protocol
//!
//! [`ConsumeEngine::consume`] starts a *session* for a subscribed consumer: a
//! dedicated tokio task that performs one blocking read per iteration on the
//! consumer's own connection and pushes each batch into a channel of
//! capacity 1. The caller drains it through the returned [`Consumption`].
//!
//! ```text
//!   session task                                       caller
//! ┌──────────────────────────────┐   mpsc(1)   ┌──────────────────────┐
//! │ read (dedicated connection)  │ ──────────► │ consumption          │
//! │ filter / control handling    │   batches   │   .next_batch().await│
//! │ shared connection for writes │             └──────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! ## Read Strategy
//!
//! - **Team mode**: group read at `>` with NOACK. Every entry goes to exactly
//!   one member of the team and is never redelivered. An explicit `from` id
//!   first pages through the consumer's history from that id; the first
//!   short page switches the session to `>`.
//! - **Solo mode**: positional read after the consumer's cursor. The cursor
//!   starts where the consumer's group was at subscribe time (or at an
//!   explicit `from` id) and advances to the last entry seen in each batch.
//!
//! ## One Iteration
//!
//! 1. Blocking read of up to `count` entries for up to `timeout`
//! 2. On timeout: in solo mode check the stream still exists (a deleted
//!    stream fails the session); with `message_on_timeout` yield
//!    `[Message { id: last delivered id, data: None }]`
//! 3. For each entry, decode the envelope:
//!    - `origin` of the requested type: deliver it
//!    - `unsubscribe` for this consumer: delete the entry (every occurrence)
//!      and end the session after this batch
//!    - `unsubscribe` for a teammate (team mode only): publish it again so
//!      another reader of the team can pick it up, then delete the original;
//!      teammates this process already retired just get the entry deleted
//!    - anything else is skipped
//! 4. Yield the batch; after an own unsubscribe, retire the consumer first
//!    and make this the last batch
//!
//! Dropping the [`Consumption`] ends the session after its in-flight read.

use crate::error::{ChannelError, Result};
use crate::lifecycle::LifecycleManager;
use crate::registry::{ConsumerSlot, LocalConsumerRegistry};
use crate::tunnel::{Message, Tunnel, TunnelMode};
use channelhouse_core::{ControlEnvelope, UnsubscribeTarget, DEFAULT_ORIGIN_TYPE};
use channelhouse_store::{
    GroupReadOptions, StoreError, StreamEntry, StreamStore, POSITION_UNDELIVERED,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Settings of one consume session.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Message type to deliver (default: "all").
    pub kind: String,

    /// Maximum entries per read (default: 100).
    pub count: usize,

    /// Maximum time one read blocks (default: 10s).
    pub timeout: Duration,

    /// Read position (default: ">"). In solo mode any other value replaces
    /// the subscribe-time cursor.
    pub from: String,

    /// Yield a synthetic batch when a read times out (default: false).
    pub message_on_timeout: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            kind: DEFAULT_ORIGIN_TYPE.to_string(),
            count: 100,
            timeout: Duration::from_millis(10_000),
            from: POSITION_UNDELIVERED.to_string(),
            message_on_timeout: false,
        }
    }
}

impl ConsumeOptions {
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_id(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn message_on_timeout(mut self, enabled: bool) -> Self {
        self.message_on_timeout = enabled;
        self
    }
}

/// Starts consume sessions.
pub struct ConsumeEngine {
    store: Arc<dyn StreamStore>,
    registry: Arc<LocalConsumerRegistry>,
    lifecycle: Arc<LifecycleManager>,
}

impl ConsumeEngine {
    pub fn new(
        store: Arc<dyn StreamStore>,
        registry: Arc<LocalConsumerRegistry>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
        }
    }

    /// Starts a session for the tunnel's consumer.
    ///
    /// # Errors
    ///
    /// - `InvalidTunnel`: the tunnel is not subscribed through this instance,
    ///   or the consumer already has a running session
    pub async fn consume(&self, tunnel: &Tunnel, options: ConsumeOptions) -> Result<Consumption> {
        let (Some(consumer), Some(_team)) = (tunnel.consumer(), tunnel.team()) else {
            return Err(ChannelError::InvalidTunnel(
                "consume requires a subscribed tunnel".to_string(),
            ));
        };

        let slot = match self.registry.get(consumer).await {
            Some(slot) if slot.key() == tunnel.key() => slot,
            _ => {
                return Err(ChannelError::InvalidTunnel(format!(
                    "consumer '{consumer}' is not subscribed to '{}'",
                    tunnel.key()
                )))
            }
        };
        if !slot.try_begin_session() {
            return Err(ChannelError::InvalidTunnel(format!(
                "consumer '{consumer}' already has a running consume session"
            )));
        }

        let mode = slot.tunnel().mode().unwrap_or(TunnelMode::Solo);
        if mode == TunnelMode::Solo && options.from != POSITION_UNDELIVERED {
            slot.set_cursor(&options.from).await;
        }

        let (sender, receiver) = mpsc::channel(1);
        let session = Session {
            key: slot.key().to_string(),
            consumer: slot.consumer().to_string(),
            team: slot.team().to_string(),
            mode,
            slot,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            lifecycle: Arc::clone(&self.lifecycle),
            position: options.from.clone(),
            options,
            last_delivered: None,
        };
        info!(
            key = %session.key,
            consumer = %session.consumer,
            mode = ?mode,
            kind = %session.options.kind,
            "Starting consume session"
        );
        tokio::spawn(session.run(sender));

        Ok(Consumption { receiver })
    }
}

/// Lazy sequence of batches delivered to one consumer.
///
/// Ends after the batch in which the consumer saw its own unsubscribe entry,
/// or after yielding the error that failed the session.
pub struct Consumption {
    receiver: mpsc::Receiver<Result<Vec<Message>>>,
}

impl Consumption {
    /// Waits for the next batch. `None` once the session has ended.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<Message>>> {
        self.receiver.recv().await
    }
}

impl Stream for Consumption {
    type Item = Result<Vec<Message>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Outcome of one iteration.
enum Step {
    /// Nothing to hand out; read again.
    Idle,
    /// A batch for the caller; the session continues.
    Batch(Vec<Message>),
    /// The last batch; the consumer was unsubscribed.
    Last(Vec<Message>),
}

struct Session {
    key: String,
    consumer: String,
    team: String,
    mode: TunnelMode,
    slot: Arc<ConsumerSlot>,
    store: Arc<dyn StreamStore>,
    registry: Arc<LocalConsumerRegistry>,
    lifecycle: Arc<LifecycleManager>,
    options: ConsumeOptions,
    /// Team-mode group read position.
    position: String,
    last_delivered: Option<String>,
}

impl Session {
    async fn run(mut self, sender: mpsc::Sender<Result<Vec<Message>>>) {
        loop {
            if sender.is_closed() {
                debug!(key = %self.key, consumer = %self.consumer, "Consumption dropped");
                break;
            }

            match self.iterate().await {
                Ok(Step::Idle) => {}
                Ok(Step::Batch(batch)) => {
                    if sender.send(Ok(batch)).await.is_err() {
                        debug!(key = %self.key, consumer = %self.consumer, "Consumption dropped");
                        break;
                    }
                }
                Ok(Step::Last(batch)) => {
                    self.lifecycle.retire(&self.slot, false).await;
                    self.slot.end_session();
                    info!(key = %self.key, consumer = %self.consumer, "Consume session ended by unsubscribe");
                    if sender.send(Ok(batch)).await.is_err() {
                        debug!(key = %self.key, consumer = %self.consumer, "Consumption dropped");
                    }
                    return;
                }
                Err(e) => {
                    self.slot.end_session();
                    if self.slot.is_retired() {
                        // Retired underneath the read by cleanup or delete.
                        info!(key = %self.key, consumer = %self.consumer, "Consume session ended by retirement");
                        return;
                    }
                    error!(
                        key = %self.key,
                        consumer = %self.consumer,
                        error = %e,
                        "Consume session failed"
                    );
                    if sender.send(Err(e)).await.is_err() {
                        debug!(key = %self.key, consumer = %self.consumer, "Consumption dropped");
                    }
                    return;
                }
            }
        }
        self.slot.end_session();
    }

    async fn iterate(&mut self) -> Result<Step> {
        let read = self.read().await;
        let entries = read.map_err(|e| self.consume_error(e))?;

        if entries.is_empty() {
            if self.mode == TunnelMode::Solo && !self.stream_exists().await? {
                return Err(self.consume_error(StoreError::NoSuchKey(self.key.clone())));
            }
            if self.options.message_on_timeout {
                return Ok(Step::Batch(vec![Message::timeout(self.last_delivered.clone())]));
            }
            return Ok(Step::Idle);
        }

        let mut batch = Vec::new();
        let mut unsubscribing = false;

        for entry in &entries {
            match self.decode(entry) {
                Some(ControlEnvelope::Origin(kind)) => {
                    if kind == self.options.kind {
                        let data = entry.fields[0].1.clone();
                        batch.push(Message::delivered(entry.id.clone(), data));
                        self.last_delivered = Some(entry.id.clone());
                    }
                }
                Some(ControlEnvelope::Unsubscribe(target)) => {
                    if target.is(&self.team, &self.consumer) {
                        self.delete_entry(&entry.id).await?;
                        if !unsubscribing {
                            debug!(key = %self.key, consumer = %self.consumer, "Received own unsubscribe");
                        }
                        unsubscribing = true;
                    } else if self.mode == TunnelMode::Team {
                        self.forward(&target, &entry.id).await?;
                    }
                }
                None => {}
            }
        }

        if self.mode == TunnelMode::Solo {
            if let Some(last) = entries.last() {
                self.slot.set_cursor(&last.id).await;
            }
        }

        Ok(if unsubscribing {
            Step::Last(batch)
        } else {
            Step::Batch(batch)
        })
    }

    async fn read(&mut self) -> std::result::Result<Vec<StreamEntry>, StoreError> {
        let connection = Arc::clone(self.slot.connection().store());
        match self.mode {
            TunnelMode::Team => {
                let options = GroupReadOptions {
                    count: self.options.count,
                    block: self.options.timeout,
                    no_ack: true,
                };

                if self.position != POSITION_UNDELIVERED {
                    // History reads never block, so they must not repeat forever.
                    let history = connection
                        .group_read(
                            &self.key,
                            &self.team,
                            &self.consumer,
                            &self.position,
                            options,
                        )
                        .await?;
                    if self.options.count > 0 && history.len() >= self.options.count {
                        if let Some(last) = history.last() {
                            self.position = last.id.clone();
                        }
                        return Ok(history);
                    }

                    debug!(
                        key = %self.key,
                        consumer = %self.consumer,
                        "History drained, reading new entries"
                    );
                    self.position = POSITION_UNDELIVERED.to_string();
                    if !history.is_empty() {
                        return Ok(history);
                    }
                }

                connection
                    .group_read(
                        &self.key,
                        &self.team,
                        &self.consumer,
                        POSITION_UNDELIVERED,
                        options,
                    )
                    .await
            }
            TunnelMode::Solo => {
                let cursor = self.slot.cursor().await;
                connection
                    .read(&self.key, &cursor, self.options.count, self.options.timeout)
                    .await
            }
        }
    }

    fn decode(&self, entry: &StreamEntry) -> Option<ControlEnvelope> {
        let Some((field, _)) = entry.fields.first() else {
            warn!(key = %self.key, id = %entry.id, "Skipping entry without fields");
            return None;
        };
        match ControlEnvelope::decode(field) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(key = %self.key, id = %entry.id, error = %e, "Skipping entry with unknown envelope");
                None
            }
        }
    }

    /// Hands a teammate's unsubscribe entry on to the rest of the team.
    async fn forward(&self, target: &UnsubscribeTarget, id: &str) -> Result<()> {
        // Entries for other teams reach those teams through their own groups.
        if target.team != self.team {
            return Ok(());
        }

        if !self.registry.is_retired(&target.consumer).await {
            self.lifecycle
                .publish_unsubscribe(&self.key, &target.team, &target.consumer)
                .await?;
            debug!(
                key = %self.key,
                consumer = %self.consumer,
                target = %target.consumer,
                "Forwarded teammate unsubscribe"
            );
        }
        self.delete_entry(id).await
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        self.store
            .delete_entry(&self.key, id)
            .await
            .map_err(|e| self.consume_error(e))?;
        Ok(())
    }

    async fn stream_exists(&self) -> Result<bool> {
        self.store
            .exists(&self.key)
            .await
            .map_err(|e| self.consume_error(e))
    }

    fn consume_error(&self, source: StoreError) -> ChannelError {
        ChannelError::Consume {
            key: self.key.clone(),
            consumer: self.consumer.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ConsumeOptions::default();
        assert_eq!(options.kind, "all");
        assert_eq!(options.count, 100);
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.from, ">");
        assert!(!options.message_on_timeout);
    }

    #[test]
    fn test_option_setters() {
        let options = ConsumeOptions::default()
            .kind("orders")
            .count(5)
            .timeout(Duration::from_millis(250))
            .from_id("0-0")
            .message_on_timeout(true);
        assert_eq!(options.kind, "orders");
        assert_eq!(options.count, 5);
        assert_eq!(options.from, "0-0");
        assert!(options.message_on_timeout);
    }
}

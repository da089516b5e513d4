//! Local Consumer Registry
//!
//! Process-local bookkeeping of every consumer subscribed through one
//! [`Channels`](crate::Channels) instance: its tunnel, its dedicated
//! connection, its solo read cursor and whether a consume session is running.
//!
//! ## Concurrency
//!
//! - Map mutations are atomic under the registry's locks
//! - Whole operations on one consumer id (subscribe, retire) are serialized
//!   with a per-consumer gate, see [`LocalConsumerRegistry::gate`]. A gate is
//!   dropped from the map once its last holder releases it
//! - Retired ids are remembered per stream key and forgotten when the stream
//!   is released or the facade is cleaned up
//! - A slot's session flag lives in a `watch` channel so `delete` can wait
//!   for a running session to retire

use crate::tunnel::{ConnectionHandle, Tunnel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};

type GateMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Registry entry of one subscribed consumer.
pub struct ConsumerSlot {
    tunnel: Tunnel,
    connection: ConnectionHandle,
    cursor: Mutex<String>,
    session: watch::Sender<bool>,
    retired: AtomicBool,
}

impl ConsumerSlot {
    pub(crate) fn new(tunnel: Tunnel, connection: ConnectionHandle, cursor: String) -> Self {
        let (session, _) = watch::channel(false);
        Self {
            tunnel,
            connection,
            cursor: Mutex::new(cursor),
            session,
            retired: AtomicBool::new(false),
        }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn key(&self) -> &str {
        self.tunnel.key()
    }

    pub fn consumer(&self) -> &str {
        self.tunnel.consumer().unwrap_or_default()
    }

    pub fn team(&self) -> &str {
        self.tunnel.team().unwrap_or_default()
    }

    pub(crate) fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Solo-mode read position.
    pub(crate) async fn cursor(&self) -> String {
        self.cursor.lock().await.clone()
    }

    pub(crate) async fn set_cursor(&self, id: &str) {
        *self.cursor.lock().await = id.to_string();
    }

    /// Whether retirement of this consumer has started.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Whether a consume session is running.
    pub fn session_active(&self) -> bool {
        *self.session.borrow()
    }

    /// Marks a session as running. Returns `false` if one already was.
    pub(crate) fn try_begin_session(&self) -> bool {
        self.session.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        })
    }

    pub(crate) fn end_session(&self) {
        self.session.send_replace(false);
    }

    /// Waits until no session is running.
    pub(crate) async fn wait_idle(&self) {
        let mut session = self.session.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = session.wait_for(|active| !*active).await;
    }
}

/// Held while an operation on one consumer id runs.
///
/// On drop the gate leaves the map unless another caller is waiting on it.
pub(crate) struct ConsumerGate {
    consumer: String,
    guard: Option<OwnedMutexGuard<()>>,
    gates: Arc<GateMap>,
}

impl Drop for ConsumerGate {
    fn drop(&mut self) {
        self.guard.take();
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if gates
            .get(&self.consumer)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.consumer);
        }
    }
}

/// Consumers subscribed through one facade instance, keyed by consumer id.
#[derive(Default)]
pub struct LocalConsumerRegistry {
    slots: RwLock<HashMap<String, Arc<ConsumerSlot>>>,
    /// Retired consumer id to the stream key it was retired from.
    retired: RwLock<HashMap<String, String>>,
    gates: Arc<GateMap>,
}

impl LocalConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes whole operations on one consumer id.
    pub(crate) async fn gate(&self, consumer: &str) -> ConsumerGate {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(consumer.to_string()).or_default())
        };
        ConsumerGate {
            consumer: consumer.to_string(),
            guard: Some(gate.lock_owned().await),
            gates: Arc::clone(&self.gates),
        }
    }

    pub async fn get(&self, consumer: &str) -> Option<Arc<ConsumerSlot>> {
        self.slots.read().await.get(consumer).cloned()
    }

    pub async fn contains(&self, consumer: &str) -> bool {
        self.slots.read().await.contains_key(consumer)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub(crate) async fn insert(&self, slot: Arc<ConsumerSlot>) {
        let consumer = slot.consumer().to_string();
        self.retired.write().await.remove(&consumer);
        self.slots.write().await.insert(consumer, slot);
    }

    /// Removes a consumer and remembers it as retired from its stream.
    pub(crate) async fn retire(&self, slot: &ConsumerSlot) -> Option<Arc<ConsumerSlot>> {
        self.retired
            .write()
            .await
            .insert(slot.consumer().to_string(), slot.key().to_string());
        self.slots.write().await.remove(slot.consumer())
    }

    /// Whether the consumer was torn down by this process and not
    /// subscribed again since.
    pub async fn is_retired(&self, consumer: &str) -> bool {
        self.retired.read().await.contains_key(consumer)
    }

    /// Forgets the consumers retired from a released stream.
    pub(crate) async fn forget_stream(&self, key: &str) {
        self.retired.write().await.retain(|_, retired_from| retired_from != key);
    }

    /// Forgets every retired consumer.
    pub(crate) async fn forget_all(&self) {
        self.retired.write().await.clear();
    }

    pub(crate) async fn retired_count(&self) -> usize {
        self.retired.read().await.len()
    }

    pub(crate) fn gate_count(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Consumers subscribed to a stream key.
    pub async fn on_stream(&self, key: &str) -> Vec<Arc<ConsumerSlot>> {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.key() == key)
            .cloned()
            .collect()
    }

    /// Every registered consumer.
    pub async fn all(&self) -> Vec<Arc<ConsumerSlot>> {
        self.slots.read().await.values().cloned().collect()
    }
}

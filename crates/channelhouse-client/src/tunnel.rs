//! Tunnels and Messages
//!
//! A [`Tunnel`] is the handle threaded through every channel operation. It is
//! created by [`Channels::use_group`](crate::Channels::use_group) carrying only
//! the resolved stream key, and [`Channels::subscribe`](crate::Channels::subscribe)
//! fills in the consumer identity and the consumer's dedicated connection.
//!
//! ```text
//! use_group("orders")      subscribe(team, consumer)        unsubscribe teardown
//! ┌──────────────────┐     ┌──────────────────────────┐     ┌──────────────────┐
//! │ key              │ ──► │ key                      │ ──► │ key              │
//! │                  │     │ consumer, team, mode     │     │                  │
//! │                  │     │ connection               │     │                  │
//! └──────────────────┘     └──────────────────────────┘     └──────────────────┘
//! ```
//!
//! Tunnels are plain values. The process-local registry keeps its own copy of
//! every subscribed tunnel and is the authority on whether a consumer is still
//! live; a caller's copy keeps its fields after the consumer was torn down.

use bytes::Bytes;
use channelhouse_store::StreamStore;
use std::fmt;
use std::sync::Arc;

/// How a subscribed consumer reads its stream, fixed at subscribe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Competing consumers: every message goes to one member of the team.
    Team,
    /// A team of one reading every message with its own cursor.
    Solo,
}

/// Dedicated store connection of one consumer.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<dyn StreamStore>);

impl ConnectionHandle {
    pub(crate) fn new(store: Arc<dyn StreamStore>) -> Self {
        Self(store)
    }

    pub(crate) fn store(&self) -> &Arc<dyn StreamStore> {
        &self.0
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionHandle(..)")
    }
}

/// Addressable handle of a group's stream and, once subscribed, a consumer.
#[derive(Debug, Clone, Default)]
pub struct Tunnel {
    key: String,
    consumer: Option<String>,
    team: Option<String>,
    mode: Option<TunnelMode>,
    connection: Option<ConnectionHandle>,
}

impl Tunnel {
    /// Creates an unsubscribed tunnel for a stream key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Physical stream key of the tunnel's group.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref()
    }

    pub fn mode(&self) -> Option<TunnelMode> {
        self.mode
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Whether consumer, team and connection are all set.
    pub fn is_subscribed(&self) -> bool {
        self.consumer.is_some() && self.team.is_some() && self.connection.is_some()
    }

    pub(crate) fn bind(
        &mut self,
        consumer: String,
        team: String,
        mode: TunnelMode,
        connection: ConnectionHandle,
    ) {
        self.consumer = Some(consumer);
        self.team = Some(team);
        self.mode = Some(mode);
        self.connection = Some(connection);
    }
}

/// One delivered message.
///
/// `id` and `data` are both `None` only in the synthetic batch yielded on a
/// read timeout before anything was delivered; after a delivery the timeout
/// batch carries the last delivered id with no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Option<String>,
    pub data: Option<Bytes>,
}

impl Message {
    pub(crate) fn delivered(id: String, data: Bytes) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
        }
    }

    pub(crate) fn timeout(last_delivered: Option<String>) -> Self {
        Self {
            id: last_delivered,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channelhouse_store::MemoryStore;

    #[test]
    fn test_bind() {
        let store: Arc<dyn StreamStore> = Arc::new(MemoryStore::new());
        let mut tunnel = Tunnel::new("app-channels-1|g");
        assert!(!tunnel.is_subscribed());

        tunnel.bind(
            "c1".to_string(),
            "c1".to_string(),
            TunnelMode::Solo,
            ConnectionHandle::new(store),
        );
        assert!(tunnel.is_subscribed());
        assert_eq!(tunnel.consumer(), Some("c1"));
        assert_eq!(tunnel.mode(), Some(TunnelMode::Solo));
        assert_eq!(tunnel.key(), "app-channels-1|g");
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            Message::timeout(None),
            Message {
                id: None,
                data: None
            }
        );
    }
}

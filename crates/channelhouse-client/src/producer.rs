//! Producer - Enveloped Appends with Bounded Retention
//!
//! Every produced message becomes one stream entry whose field name is the
//! `origin` envelope of the message type and whose value is the payload:
//!
//! ```text
//! XADD <key> MAXLEN ~ <overflow> * {"context":"origin","content":"<type>"} <payload>
//! ```
//!
//! The cap is approximate: the store may keep somewhat more than `overflow`
//! entries when trimming exactly would be expensive.

use crate::error::{ChannelError, Result};
use crate::tunnel::Tunnel;
use channelhouse_core::ControlEnvelope;
use channelhouse_store::StreamStore;
use std::sync::Arc;
use tracing::debug;

/// Appends application messages to tunnel streams.
pub struct Producer {
    store: Arc<dyn StreamStore>,
    overflow: usize,
}

impl Producer {
    pub fn new(store: Arc<dyn StreamStore>, overflow: usize) -> Self {
        Self { store, overflow }
    }

    /// Appends `message` of type `kind` and returns the store-assigned id.
    ///
    /// # Errors
    ///
    /// - `InvalidTunnel`: the tunnel has no stream key (no store call is made)
    /// - `Produce`: the append failed; nothing was written
    pub async fn produce(&self, tunnel: &Tunnel, message: &[u8], kind: &str) -> Result<String> {
        if tunnel.key().is_empty() {
            return Err(ChannelError::InvalidTunnel(
                "produce requires a stream key".to_string(),
            ));
        }

        let field = ControlEnvelope::origin(kind).encode()?;
        let id = self
            .store
            .append(tunnel.key(), Some(self.overflow), &field, message)
            .await
            .map_err(|source| ChannelError::Produce {
                key: tunnel.key().to_string(),
                source,
            })?;

        debug!(key = %tunnel.key(), kind = %kind, id = %id, bytes = message.len(), "Produced message");
        Ok(id)
    }
}

//! Control Envelope
//!
//! Every stream entry carries exactly one field. The field *name* is a JSON
//! envelope saying what the entry means; the field *value* is the raw
//! application payload (empty for control entries).
//!
//! ```text
//! {"context":"origin","content":"all"}                                 -> payload
//! {"context":"unsubscribe","content":{"team":"t","consumer":"c"}}     -> ""
//! ```
//!
//! The envelope is decoded into [`ControlEnvelope`] before any branching.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Message type used when the producer does not pick one.
pub const DEFAULT_ORIGIN_TYPE: &str = "all";

/// Decoded form of an entry's field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "context", content = "content", rename_all = "lowercase")]
pub enum ControlEnvelope {
    /// Application data of the given type.
    Origin(String),
    /// Request for the addressed consumer to leave its team.
    Unsubscribe(UnsubscribeTarget),
}

/// Team member an unsubscribe request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnsubscribeTarget {
    pub team: String,
    pub consumer: String,
}

impl ControlEnvelope {
    pub fn origin(kind: impl Into<String>) -> Self {
        ControlEnvelope::Origin(kind.into())
    }

    pub fn unsubscribe(team: impl Into<String>, consumer: impl Into<String>) -> Self {
        ControlEnvelope::Unsubscribe(UnsubscribeTarget {
            team: team.into(),
            consumer: consumer.into(),
        })
    }

    /// Encodes the envelope into the wire field name.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a wire field name.
    pub fn decode(field: &str) -> Result<Self> {
        Ok(serde_json::from_str(field)?)
    }
}

impl UnsubscribeTarget {
    pub fn is(&self, team: &str, consumer: &str) -> bool {
        self.team == team && self.consumer == consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            ControlEnvelope::origin("all").encode().unwrap(),
            r#"{"context":"origin","content":"all"}"#
        );
        assert_eq!(
            ControlEnvelope::unsubscribe("team", "one").encode().unwrap(),
            r#"{"context":"unsubscribe","content":{"team":"team","consumer":"one"}}"#
        );
    }

    #[test]
    fn test_decode_ignores_key_order() {
        let envelope =
            ControlEnvelope::decode(r#"{"content":{"consumer":"c","team":"t"},"context":"unsubscribe"}"#)
                .unwrap();
        assert_eq!(envelope, ControlEnvelope::unsubscribe("t", "c"));
    }

    #[test]
    fn test_decode_rejects_foreign_fields() {
        assert!(ControlEnvelope::decode("payload").is_err());
        assert!(ControlEnvelope::decode(r#"{"context":"other","content":"x"}"#).is_err());
        // Unsubscribe requests must name both team and consumer.
        assert!(ControlEnvelope::decode(r#"{"context":"unsubscribe","content":"team"}"#).is_err());
    }

    #[test]
    fn test_target_matching() {
        let target = UnsubscribeTarget {
            team: "team".into(),
            consumer: "one".into(),
        };
        assert!(target.is("team", "one"));
        assert!(!target.is("team", "two"));
        assert!(!target.is("other", "one"));
    }
}

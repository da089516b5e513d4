//! Shard Tag Tables
//!
//! A clustered stream store places every key on one of 16384 hash slots, chosen
//! from the substring between the first `{` and `}` of the key (the hash tag).
//! The tags below were picked so that, under the store's CRC16 slot function,
//! the 32 (or 64) tags land on evenly spaced slots. Embedding one of them in a
//! stream key pins that stream to a known shard of the slot space.
//!
//! The tables are fixed: changing them would move every existing stream.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

const SHARDS_32: [&str; 32] = [
    "{10}", "{113}", "{21}", "{3}", "{61}", "{72}", "{50}", "{43}",
    "{11}", "{112}", "{20}", "{2}", "{60}", "{73}", "{51}", "{42}",
    "{12}", "{111}", "{23}", "{1}", "{63}", "{70}", "{52}", "{41}",
    "{13}", "{110}", "{22}", "{0}", "{62}", "{71}", "{53}", "{40}",
];

const SHARDS_64: [&str; 64] = [
    "{10}", "{18}", "{113}", "{342}", "{29}", "{21}", "{3}", "{122}",
    "{69}", "{61}", "{72}", "{162}", "{50}", "{58}", "{153}", "{43}",
    "{11}", "{19}", "{112}", "{343}", "{28}", "{20}", "{2}", "{123}",
    "{68}", "{60}", "{73}", "{163}", "{51}", "{59}", "{152}", "{42}",
    "{12}", "{102}", "{111}", "{119}", "{133}", "{23}", "{1}", "{9}",
    "{173}", "{63}", "{70}", "{78}", "{52}", "{142}", "{49}", "{41}",
    "{13}", "{103}", "{110}", "{118}", "{132}", "{22}", "{0}", "{8}",
    "{172}", "{62}", "{71}", "{79}", "{53}", "{143}", "{48}", "{40}",
];

/// Number of shards the hash-slot space is split into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SlotCount {
    /// 32 shards (default)
    #[default]
    S32,
    /// 64 shards
    S64,
}

impl SlotCount {
    /// Number of shards.
    pub const fn len(self) -> usize {
        match self {
            SlotCount::S32 => 32,
            SlotCount::S64 => 64,
        }
    }

    /// The ordered tag table for this slot count.
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            SlotCount::S32 => &SHARDS_32,
            SlotCount::S64 => &SHARDS_64,
        }
    }

    /// Tag of shard `index`, if it exists.
    pub fn tag(self, index: usize) -> Option<&'static str> {
        self.tags().get(index).copied()
    }
}

impl TryFrom<u32> for SlotCount {
    type Error = CoreError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            32 => Ok(SlotCount::S32),
            64 => Ok(SlotCount::S64),
            other => Err(CoreError::InvalidSlots(other)),
        }
    }
}

impl From<SlotCount> for u32 {
    fn from(slots: SlotCount) -> Self {
        slots.len() as u32
    }
}

//! Key Addressing
//!
//! Builds every key the channels layer touches in the store. All keys share
//! one prefix, `<application>-<schema>-<version>`, so several applications (or
//! several schema versions of one application) can live in the same store.
//!
//! The two control keys (group map and shard index) carry shard tag 0 and the
//! `[0]` suffix, so in a clustered store they always live on the first shard.

use crate::shards::SlotCount;

/// Separator between prefix and the group map name.
pub const SEP_HASH: &str = "#";
/// Separator between prefix and a stream name.
pub const SEP_STREAM: &str = "|";
/// Separator between prefix and the shard index name.
pub const SEP_INDEX: &str = ":";
/// Opens the trailing shard number.
pub const SEP_OPEN: &str = "[";
/// Closes the trailing shard number.
pub const SEP_CLOSE: &str = "]";
/// Joins the prefix parts.
pub const SEP_BIND: &str = "-";

const KEYS_NAME: &str = "keys";
const SHARDS_NAME: &str = "shards";

/// Key builder for one application/schema/version prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    slots: SlotCount,
}

impl KeySpace {
    pub fn new(application: &str, schema: &str, version: u32, slots: SlotCount) -> Self {
        Self {
            prefix: format!("{application}{SEP_BIND}{schema}{SEP_BIND}{version}"),
            slots,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn slots(&self) -> SlotCount {
        self.slots
    }

    /// Stream key of a group in non-sharded mode.
    pub fn stream_key(&self, group: &str) -> String {
        format!("{}{SEP_STREAM}{group}", self.prefix)
    }

    /// Stream key of a group pinned to `shard`.
    ///
    /// Returns `None` when `shard` is outside the tag table.
    pub fn sharded_stream_key(&self, shard: usize, group: &str) -> Option<String> {
        let tag = self.slots.tag(shard)?;
        Some(format!(
            "{}{SEP_STREAM}{tag}{group}{SEP_OPEN}{shard}{SEP_CLOSE}",
            self.prefix
        ))
    }

    /// Hash mapping group names to sharded stream keys.
    pub fn group_map_key(&self) -> String {
        format!("{}{SEP_HASH}{KEYS_NAME}{}", self.prefix, self.control_suffix())
    }

    /// Sorted set holding the load score of every shard.
    pub fn shard_index_key(&self) -> String {
        format!(
            "{}{SEP_INDEX}{SHARDS_NAME}{}",
            self.prefix,
            self.control_suffix()
        )
    }

    fn control_suffix(&self) -> String {
        let tag = self.slots.tags()[0];
        format!("{tag}{SEP_OPEN}0{SEP_CLOSE}")
    }
}

/// Parses the shard number out of a sharded stream key's trailing `[n]`.
pub fn shard_of(key: &str) -> Option<usize> {
    let body = key.strip_suffix(SEP_CLOSE)?;
    let open = body.rfind(SEP_OPEN)?;
    let digits = &body[open + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> KeySpace {
        KeySpace::new("app", "channels", 1, SlotCount::S32)
    }

    #[test]
    fn test_prefix_and_stream_keys() {
        let keys = space();
        assert_eq!(keys.prefix(), "app-channels-1");
        assert_eq!(keys.stream_key("orders"), "app-channels-1|orders");
        assert_eq!(
            keys.sharded_stream_key(1, "orders").unwrap(),
            "app-channels-1|{113}orders[1]"
        );
        assert!(keys.sharded_stream_key(32, "orders").is_none());
    }

    #[test]
    fn test_control_keys() {
        let keys = space();
        assert_eq!(keys.group_map_key(), "app-channels-1#keys{10}[0]");
        assert_eq!(keys.shard_index_key(), "app-channels-1:shards{10}[0]");
    }

    #[test]
    fn test_shard_of() {
        assert_eq!(shard_of("app-channels-1|{113}orders[1]"), Some(1));
        assert_eq!(shard_of("app-channels-1|{40}g[31]"), Some(31));
        // Group names may themselves contain brackets; only the suffix counts.
        assert_eq!(shard_of("p|{3}a[b][3]"), Some(3));
        assert_eq!(shard_of("app-channels-1|orders"), None);
        assert_eq!(shard_of("p|{3}g[]"), None);
        assert_eq!(shard_of("p|{3}g[x1]"), None);
    }

    #[test]
    fn test_round_trip_every_shard() {
        let keys = KeySpace::new("app", "channels", 1, SlotCount::S64);
        for shard in 0..64 {
            let key = keys.sharded_stream_key(shard, "group").unwrap();
            assert_eq!(shard_of(&key), Some(shard));
        }
    }
}

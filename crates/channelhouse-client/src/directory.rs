//! Shard Directory - Group to Stream Key Resolution
//!
//! The ShardDirectory maps a logical group name onto the physical stream key
//! its traffic lives on.
//!
//! ## Non-sharded Mode
//!
//! The key is derived without a store round-trip: `prefix|group`.
//!
//! ## Sharded Mode
//!
//! Groups are spread over the store's hash-slot space using a fixed table of
//! 32 or 64 shard tags. Two control structures, shared by every process using
//! the same key prefix, hold the assignment state:
//!
//! ```text
//! prefix#keys{10}[0]     hash        group -> stream key
//! prefix:shards{10}[0]   sorted set  shard index -> number of groups
//! ```
//!
//! Resolving a new group:
//!
//! 1. **Look up**: a mapped group returns its key unchanged
//! 2. **Pick**: read the lowest-scored shard (ties by member order),
//!    initializing all N scores to 0 when the index is empty
//! 3. **Compose**: `prefix|<tag>group[<shard>]`
//! 4. **Persist**: store the mapping, then bump the shard's score by 1
//!
//! There is no transaction across these steps. Retrying a resolve is safe,
//! but a crash between persisting the mapping and bumping the score leaves
//! that score one short, and two processes resolving the same new group at
//! once may both bump it. Scores are only eventually fair under contention.

use crate::error::DirectoryError;
use channelhouse_core::{shard_of, KeySpace};
use channelhouse_store::{ScoreBound, ScoredMember, StreamStore};
use std::sync::Arc;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, DirectoryError>;

/// Resolves groups to stream keys and tracks shard load.
pub struct ShardDirectory {
    store: Arc<dyn StreamStore>,
    keys: KeySpace,
    sharded: bool,
    group_map: String,
    shard_index: String,
}

impl ShardDirectory {
    /// Creates a directory over the shared store connection.
    pub fn new(store: Arc<dyn StreamStore>, keys: KeySpace, sharded: bool) -> Self {
        let group_map = keys.group_map_key();
        let shard_index = keys.shard_index_key();
        Self {
            store,
            keys,
            sharded,
            group_map,
            shard_index,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.sharded
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Resolves a group to its stream key, assigning a shard on first use.
    pub async fn resolve(&self, group: &str) -> Result<String> {
        if !self.sharded {
            return Ok(self.keys.stream_key(group));
        }

        if let Some(key) = self.store.hash_get(&self.group_map, group).await? {
            return Ok(key);
        }

        let shard = match self.lowest_shard().await? {
            Some(shard) => shard,
            None => {
                self.initialize_index().await?;
                self.lowest_shard()
                    .await?
                    .ok_or_else(|| DirectoryError::InvalidShard("empty shard index".to_string()))?
            }
        };

        let index: usize = shard
            .member
            .parse()
            .map_err(|_| DirectoryError::InvalidShard(shard.member.clone()))?;
        let key = self
            .keys
            .sharded_stream_key(index, group)
            .ok_or_else(|| DirectoryError::InvalidShard(shard.member.clone()))?;

        self.store.hash_set(&self.group_map, group, &key).await?;
        let score = self
            .store
            .increment_score(&self.shard_index, 1, &shard.member)
            .await?;

        info!(
            group = %group,
            key = %key,
            shard = index,
            load = score,
            "Assigned group to shard"
        );
        Ok(key)
    }

    /// Returns the group's stream key without assigning one.
    pub async fn lookup(&self, group: &str) -> Result<Option<String>> {
        if !self.sharded {
            return Ok(Some(self.keys.stream_key(group)));
        }
        Ok(self.store.hash_get(&self.group_map, group).await?)
    }

    /// Deletes the group's stream and, when sharded, its assignment.
    pub async fn release(&self, group: &str) -> Result<()> {
        if !self.sharded {
            let key = self.keys.stream_key(group);
            self.store.delete_key(&key).await?;
            debug!(group = %group, key = %key, "Released stream");
            return Ok(());
        }

        let key = self
            .store
            .hash_get(&self.group_map, group)
            .await?
            .ok_or(DirectoryError::UnknownGroup)?;
        let shard = shard_of(&key).ok_or_else(|| DirectoryError::MalformedKey(key.clone()))?;

        self.store.delete_key(&key).await?;
        self.store.hash_delete(&self.group_map, group).await?;
        let score = self
            .store
            .increment_score(&self.shard_index, -1, &shard.to_string())
            .await?;

        info!(
            group = %group,
            key = %key,
            shard,
            load = score,
            "Released group from shard"
        );
        Ok(())
    }

    /// Full shard load index, lowest score first.
    pub async fn load(&self) -> Result<Vec<ScoredMember>> {
        Ok(self
            .store
            .range_by_score(&self.shard_index, ScoreBound::NegInf, ScoreBound::PosInf, None)
            .await?)
    }

    async fn lowest_shard(&self) -> Result<Option<ScoredMember>> {
        let mut lowest = self
            .store
            .range_by_score(
                &self.shard_index,
                ScoreBound::NegInf,
                ScoreBound::PosInf,
                Some((0, 1)),
            )
            .await?;
        Ok(lowest.pop())
    }

    /// Creates every shard member at score 0. Harmless when repeated.
    async fn initialize_index(&self) -> Result<()> {
        let slots = self.keys.slots().len();
        for shard in 0..slots {
            self.store
                .increment_score(&self.shard_index, 0, &shard.to_string())
                .await?;
        }
        debug!(index = %self.shard_index, slots, "Initialized shard load index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channelhouse_core::SlotCount;
    use channelhouse_store::MemoryStore;

    fn directory(sharded: bool) -> (Arc<MemoryStore>, ShardDirectory) {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::new("app", "channels", 1, SlotCount::S32);
        let directory = ShardDirectory::new(store.clone(), keys, sharded);
        (store, directory)
    }

    #[tokio::test]
    async fn test_unsharded_resolve_is_pure() {
        let (store, directory) = directory(false);
        assert_eq!(directory.resolve("g").await.unwrap(), "app-channels-1|g");
        assert!(!store.exists("app-channels-1#keys{10}[0]").await.unwrap());
        assert!(directory.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_resolve_initializes_index() {
        let (_store, directory) = directory(true);
        let key = directory.resolve("g").await.unwrap();
        assert_eq!(key, "app-channels-1|{10}g[0]");

        let load = directory.load().await.unwrap();
        assert_eq!(load.len(), 32);
        assert_eq!(load.iter().map(|m| m.score).sum::<i64>(), 1);
    }

    #[tokio::test]
    async fn test_lookup_never_assigns() {
        let (_store, directory) = directory(true);
        assert_eq!(directory.lookup("g").await.unwrap(), None);
        assert!(directory.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_unknown_group() {
        let (_store, directory) = directory(true);
        assert!(matches!(
            directory.release("missing").await,
            Err(DirectoryError::UnknownGroup)
        ));
    }

    #[tokio::test]
    async fn test_release_restores_score() {
        let (store, directory) = directory(true);
        let key = directory.resolve("g").await.unwrap();
        store.append(&key, None, "f", b"v").await.unwrap();

        directory.release("g").await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(directory.lookup("g").await.unwrap(), None);
        assert!(directory.load().await.unwrap().iter().all(|m| m.score == 0));
    }

    #[tokio::test]
    async fn test_release_malformed_key() {
        let (store, directory) = directory(true);
        store
            .hash_set("app-channels-1#keys{10}[0]", "g", "app-channels-1|g")
            .await
            .unwrap();
        assert!(matches!(
            directory.release("g").await,
            Err(DirectoryError::MalformedKey(_))
        ));
    }
}

//! In-Memory Stream Store
//!
//! A complete [`StreamStore`] living inside the process. It follows the stream
//! semantics of a Redis server closely enough that the channels layer cannot
//! tell the difference:
//!
//! - Entry IDs are `<ms>-<seq>`, strictly increasing per stream
//! - `$` resolves to the stream's last ID when the read starts
//! - Group reads at `>` hand every entry to exactly one consumer of the group
//! - Consumers are created on their first group read
//! - Deleting a stream or destroying a group fails blocked group reads
//!
//! ## Differences
//!
//! - No pending-entries list is kept, so group reads always behave as NOACK
//!   and reads at an explicit ID return nothing
//! - Approximate trimming is exact
//!
//! ## Connections
//!
//! Every [`MemoryStore`] value is one connection. [`StreamStore::duplicate`]
//! returns a new connection onto the same data; connections close
//! independently. [`MemoryStore::set_offline`] makes every connection fail
//! with `Connection` errors until switched back, which is how tests simulate a
//! store outage.
//!
//! ## Blocking
//!
//! Every mutation bumps a shared version counter held in a
//! `tokio::sync::watch` channel. Blocked reads subscribe before inspecting the
//! data and re-check after every bump, so no write can slip between the check
//! and the wait.

use crate::error::{Result, StoreError};
use crate::id::EntryId;
use crate::{
    GroupInfo, GroupReadOptions, ScoreBound, ScoredMember, StreamEntry, StreamStore,
    POSITION_NEW, POSITION_UNDELIVERED,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

/// One connection to an in-process stream store.
pub struct MemoryStore {
    shared: Arc<Shared>,
    connection_id: u64,
    closed: AtomicBool,
}

struct Shared {
    data: Mutex<Data>,
    version: watch::Sender<u64>,
    offline: AtomicBool,
    next_connection_id: AtomicU64,
}

#[derive(Default)]
struct Data {
    keys: HashMap<String, Value>,
}

enum Value {
    Stream(Stream),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, i64>),
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Vec<(String, Bytes)>>,
    last_id: EntryId,
    groups: BTreeMap<String, Group>,
}

struct Group {
    last_delivered: EntryId,
    consumers: BTreeSet<String>,
}

impl Stream {
    fn after(&self, id: EntryId, count: usize) -> Vec<StreamEntry> {
        use std::ops::Bound::{Excluded, Unbounded};

        self.entries
            .range((Excluded(id), Unbounded))
            .take(count.max(1))
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            })
            .collect()
    }
}

impl Data {
    fn stream(&self, key: &str) -> Result<Option<&Stream>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Value::Stream(stream)) => Ok(Some(stream)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn stream_mut(&mut self, key: &str) -> Result<Option<&mut Stream>> {
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Value::Stream(stream)) => Ok(Some(stream)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_set_mut(&mut self, key: &str) -> Result<&mut HashMap<String, i64>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::SortedSet(HashMap::new()))
        {
            Value::SortedSet(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn group_mut(&mut self, key: &str, group: &str) -> Result<&mut Group> {
        let no_group = || StoreError::NoGroup {
            key: key.to_string(),
            group: group.to_string(),
        };
        self.stream_mut(key)?
            .ok_or_else(no_group)?
            .groups
            .get_mut(group)
            .ok_or_else(no_group)
    }
}

impl MemoryStore {
    /// Creates a new, empty store and returns its first connection.
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            data: Mutex::new(Data::default()),
            version,
            offline: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
        });
        Self {
            shared,
            connection_id: 0,
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier of this connection, unique within the store.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether this connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes every connection of this store fail (or recover).
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
        self.notify();
    }

    /// All entries currently held by a stream, oldest first.
    pub async fn entries(&self, key: &str) -> Vec<StreamEntry> {
        let data = self.shared.data.lock().await;
        match data.stream(key) {
            Ok(Some(stream)) => stream.after(EntryId::ZERO, usize::MAX),
            _ => Vec::new(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store offline".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn notify(&self) {
        self.shared.version.send_modify(|v| *v += 1);
    }

    /// Runs `poll` until it yields a value or the block expires.
    ///
    /// `Ok(None)` means the block expired. A zero `block` waits forever.
    async fn block_on<T, F>(&self, block: Duration, mut poll: F) -> Result<Option<T>>
    where
        F: FnMut(&mut Data) -> Result<Option<T>> + Send,
        T: Send,
    {
        let deadline = (!block.is_zero()).then(|| Instant::now() + block);
        let mut changes = self.shared.version.subscribe();

        loop {
            self.check_open()?;
            {
                let mut data = self.shared.data.lock().await;
                if let Some(value) = poll(&mut *data)? {
                    return Ok(Some(value));
                }
            }

            let changed = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, changes.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => return Ok(None),
                },
                None => changes.changed().await,
            };
            if changed.is_err() {
                return Err(StoreError::Closed);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn append(
        &self,
        key: &str,
        cap: Option<usize>,
        field: &str,
        value: &[u8],
    ) -> Result<String> {
        self.check_open()?;
        let id = {
            let mut data = self.shared.data.lock().await;
            if data.stream(key)?.is_none() {
                data.keys
                    .insert(key.to_string(), Value::Stream(Stream::default()));
            }
            let stream = data
                .stream_mut(key)?
                .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;

            let id = stream.last_id.next_after(now_ms());
            stream
                .entries
                .insert(id, vec![(field.to_string(), Bytes::copy_from_slice(value))]);
            stream.last_id = id;

            if let Some(cap) = cap {
                while stream.entries.len() > cap {
                    stream.entries.pop_first();
                }
            }
            id
        };
        self.notify();
        Ok(id.to_string())
    }

    async fn read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.check_open()?;
        let after = if after == POSITION_NEW {
            let data = self.shared.data.lock().await;
            data.stream(key)?
                .map(|stream| stream.last_id)
                .unwrap_or_default()
        } else {
            after.parse()?
        };

        let entries = self
            .block_on(block, |data| {
                let entries = data
                    .stream(key)?
                    .map(|stream| stream.after(after, count))
                    .unwrap_or_default();
                Ok((!entries.is_empty()).then_some(entries))
            })
            .await?;
        Ok(entries.unwrap_or_default())
    }

    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        from: &str,
        options: GroupReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        self.check_open()?;

        if from != POSITION_UNDELIVERED {
            // History reads come from the pending list, which is never kept.
            from.parse::<EntryId>()?;
            let mut data = self.shared.data.lock().await;
            data.group_mut(key, group)?
                .consumers
                .insert(consumer.to_string());
            return Ok(Vec::new());
        }

        let entries = self
            .block_on(options.block, |data| {
                let group_state = data.group_mut(key, group)?;
                group_state.consumers.insert(consumer.to_string());
                let last_delivered = group_state.last_delivered;

                let entries = data
                    .stream(key)?
                    .map(|stream| stream.after(last_delivered, options.count))
                    .unwrap_or_default();
                let Some(last) = entries.last() else {
                    return Ok(None);
                };
                let last: EntryId = last.id.parse()?;
                data.group_mut(key, group)?.last_delivered = last;
                Ok(Some(entries))
            })
            .await?;
        Ok(entries.unwrap_or_default())
    }

    async fn create_group(
        &self,
        key: &str,
        group: &str,
        start: &str,
        make_stream: bool,
    ) -> Result<bool> {
        self.check_open()?;
        let mut data = self.shared.data.lock().await;

        if data.stream(key)?.is_none() {
            if !make_stream {
                return Err(StoreError::NoSuchKey(key.to_string()));
            }
            data.keys
                .insert(key.to_string(), Value::Stream(Stream::default()));
        }
        let stream = data
            .stream_mut(key)?
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;

        if stream.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = if start == POSITION_NEW {
            stream.last_id
        } else {
            start.parse()?
        };
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                consumers: BTreeSet::new(),
            },
        );
        debug!(key = %key, group = %group, "Created consumer group");
        Ok(true)
    }

    async fn delete_entry(&self, key: &str, id: &str) -> Result<u64> {
        self.check_open()?;
        let id: EntryId = id.parse()?;
        let removed = {
            let mut data = self.shared.data.lock().await;
            match data.stream_mut(key)? {
                Some(stream) => stream.entries.remove(&id).is_some(),
                None => false,
            }
        };
        Ok(u64::from(removed))
    }

    async fn remove_consumer(&self, key: &str, group: &str, consumer: &str) -> Result<u64> {
        self.check_open()?;
        {
            let mut data = self.shared.data.lock().await;
            data.group_mut(key, group)?.consumers.remove(consumer);
        }
        self.notify();
        Ok(0)
    }

    async fn list_groups(&self, key: &str) -> Result<Vec<GroupInfo>> {
        self.check_open()?;
        let data = self.shared.data.lock().await;
        let stream = data
            .stream(key)?
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;

        Ok(stream
            .groups
            .iter()
            .map(|(name, group)| GroupInfo {
                name: name.clone(),
                consumers: group.consumers.len(),
                last_delivered_id: group.last_delivered.to_string(),
            })
            .collect())
    }

    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool> {
        self.check_open()?;
        let destroyed = {
            let mut data = self.shared.data.lock().await;
            data.stream_mut(key)?
                .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?
                .groups
                .remove(group)
                .is_some()
        };
        self.notify();
        Ok(destroyed)
    }

    async fn delete_key(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        let deleted = self.shared.data.lock().await.keys.remove(key).is_some();
        self.notify();
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.shared.data.lock().await.keys.contains_key(key))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check_open()?;
        let data = self.shared.data.lock().await;
        match data.keys.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check_open()?;
        let mut data = self.shared.data.lock().await;
        data.hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.check_open()?;
        let mut data = self.shared.data.lock().await;
        let removed = match data.keys.get_mut(key) {
            None => false,
            Some(Value::Hash(hash)) => hash.remove(field).is_some(),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        if matches!(data.keys.get(key), Some(Value::Hash(hash)) if hash.is_empty()) {
            data.keys.remove(key);
        }
        Ok(removed)
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(usize, usize)>,
    ) -> Result<Vec<ScoredMember>> {
        self.check_open()?;
        let data = self.shared.data.lock().await;
        let set = match data.keys.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::SortedSet(set)) => set,
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        let mut members: Vec<ScoredMember> = set
            .iter()
            .filter(|(_, &score)| min.admits_from_below(score) && max.admits_from_above(score))
            .map(|(member, &score)| ScoredMember {
                member: member.clone(),
                score,
            })
            .collect();
        members.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.member.cmp(&b.member)));

        Ok(match limit {
            Some((offset, count)) => members.into_iter().skip(offset).take(count).collect(),
            None => members,
        })
    }

    async fn increment_score(&self, key: &str, delta: i64, member: &str) -> Result<i64> {
        self.check_open()?;
        let mut data = self.shared.data.lock().await;
        let score = data
            .sorted_set_mut(key)?
            .entry(member.to_string())
            .or_insert(0);
        *score += delta;
        Ok(*score)
    }

    async fn duplicate(&self) -> Result<Arc<dyn StreamStore>> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store offline".to_string()));
        }
        let connection_id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id, "Opened in-memory connection");
        Ok(Arc::new(MemoryStore {
            shared: Arc::clone(&self.shared),
            connection_id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection_id = self.connection_id, "Closed in-memory connection");
            self.notify();
        }
        Ok(())
    }
}

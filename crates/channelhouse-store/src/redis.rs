//! Redis Stream Store
//!
//! [`StreamStore`] over a Redis server (multiplexed connection) or a Redis
//! cluster (cluster connection). Every `duplicate` opens a fresh connection
//! from the same client, which is what blocking readers need: a blocked
//! `XREADGROUP` stalls every other command pipelined on its connection.
//!
//! ## Command Mapping
//!
//! | primitive | command |
//! |---|---|
//! | append | `XADD key MAXLEN ~ cap * field value` |
//! | read | `XREAD COUNT n BLOCK ms STREAMS key id` |
//! | group_read | `XREADGROUP GROUP g c COUNT n BLOCK ms [NOACK] STREAMS key id` |
//! | create_group | `XGROUP CREATE key g start [MKSTREAM]` |
//! | delete_entry | `XDEL key id` |
//! | remove_consumer | `XGROUP DELCONSUMER key g c` |
//! | list_groups | `XINFO GROUPS key` |
//! | destroy_group | `XGROUP DESTROY key g` |
//! | range_by_score | `ZRANGEBYSCORE key min max WITHSCORES [LIMIT o n]` |
//! | increment_score | `ZINCRBY key delta member` |

use crate::error::{Result, StoreError};
use crate::{GroupInfo, GroupReadOptions, ScoreBound, ScoredMember, StreamEntry, StreamStore};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamInfoGroupsReply, StreamReadReply};
use redis::{Cmd, FromRedisValue, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

enum Target {
    Single(redis::Client),
    Cluster(ClusterClient),
}

#[derive(Clone)]
enum Connection {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// One connection to a Redis server or cluster.
pub struct RedisStore {
    target: Arc<Target>,
    connection: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Connects to a single Redis endpoint, e.g. `redis://127.0.0.1:6379`.
    pub async fn open_url(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Self::open(Arc::new(Target::Single(client))).await
    }

    /// Connects to a Redis cluster through its seed nodes.
    pub async fn open_cluster(nodes: &[String]) -> Result<Self> {
        let client = ClusterClient::new(nodes.to_vec())?;
        Self::open(Arc::new(Target::Cluster(client))).await
    }

    async fn open(target: Arc<Target>) -> Result<Self> {
        let connection = match target.as_ref() {
            Target::Single(client) => {
                Connection::Single(client.get_multiplexed_async_connection().await?)
            }
            Target::Cluster(client) => Connection::Cluster(client.get_async_connection().await?),
        };
        debug!("Opened Redis connection");
        Ok(Self {
            target,
            connection: Mutex::new(Some(connection)),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let connection = self.connection.lock().await.clone();
        let reply = match connection {
            Some(Connection::Single(mut conn)) => cmd.query_async(&mut conn).await,
            Some(Connection::Cluster(mut conn)) => cmd.query_async(&mut conn).await,
            None => return Err(StoreError::Closed),
        };
        Ok(reply?)
    }
}

fn block_ms(block: Duration) -> u64 {
    block.as_millis() as u64
}

fn score_arg(bound: ScoreBound) -> String {
    match bound {
        ScoreBound::NegInf => "-inf".to_string(),
        ScoreBound::PosInf => "+inf".to_string(),
        ScoreBound::Inclusive(score) => score.to_string(),
    }
}

fn is_code(error: &RedisError, code: &str) -> bool {
    error.code() == Some(code)
}

fn entries(reply: Option<StreamReadReply>) -> Result<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    for key in reply.map(|r| r.keys).unwrap_or_default() {
        for id in key.ids {
            let mut fields = Vec::with_capacity(id.map.len());
            for (field, value) in id.map {
                let value: Vec<u8> = redis::from_redis_value(&value)?;
                fields.push((field, Bytes::from(value)));
            }
            entries.push(StreamEntry { id: id.id, fields });
        }
    }
    Ok(entries)
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn append(
        &self,
        key: &str,
        cap: Option<usize>,
        field: &str,
        value: &[u8],
    ) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if let Some(cap) = cap {
            cmd.arg("MAXLEN").arg("~").arg(cap);
        }
        cmd.arg("*").arg(field).arg(value);
        self.query(&cmd).await
    }

    async fn read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms(block))
            .arg("STREAMS")
            .arg(key)
            .arg(after);
        entries(self.query(&cmd).await?)
    }

    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        from: &str,
        options: GroupReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(options.count)
            .arg("BLOCK")
            .arg(block_ms(options.block));
        if options.no_ack {
            cmd.arg("NOACK");
        }
        cmd.arg("STREAMS").arg(key).arg(from);

        match self.query(&cmd).await {
            Ok(reply) => entries(reply),
            Err(StoreError::Backend(message))
                if message.contains("NOGROUP") || message.contains("UNBLOCKED") =>
            {
                Err(StoreError::NoGroup {
                    key: key.to_string(),
                    group: group.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_group(
        &self,
        key: &str,
        group: &str,
        start: &str,
        make_stream: bool,
    ) -> Result<bool> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(key).arg(group).arg(start);
        if make_stream {
            cmd.arg("MKSTREAM");
        }

        let connection = self.connection.lock().await.clone();
        let reply: redis::RedisResult<()> = match connection {
            Some(Connection::Single(mut conn)) => cmd.query_async(&mut conn).await,
            Some(Connection::Cluster(mut conn)) => cmd.query_async(&mut conn).await,
            None => return Err(StoreError::Closed),
        };
        match reply {
            Ok(()) => Ok(true),
            Err(e) if is_code(&e, "BUSYGROUP") => Ok(false),
            Err(e) if e.to_string().contains("requires the key to exist") => {
                Err(StoreError::NoSuchKey(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_entry(&self, key: &str, id: &str) -> Result<u64> {
        self.query(redis::cmd("XDEL").arg(key).arg(id)).await
    }

    async fn remove_consumer(&self, key: &str, group: &str, consumer: &str) -> Result<u64> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("DELCONSUMER").arg(key).arg(group).arg(consumer);
        match self.query(&cmd).await {
            Err(StoreError::Backend(message)) if message.contains("NOGROUP") => {
                Err(StoreError::NoGroup {
                    key: key.to_string(),
                    group: group.to_string(),
                })
            }
            other => other,
        }
    }

    async fn list_groups(&self, key: &str) -> Result<Vec<GroupInfo>> {
        let reply: StreamInfoGroupsReply =
            match self.query(redis::cmd("XINFO").arg("GROUPS").arg(key)).await {
                Err(StoreError::Backend(message)) if message.contains("no such key") => {
                    return Err(StoreError::NoSuchKey(key.to_string()))
                }
                other => other?,
            };
        Ok(reply
            .groups
            .into_iter()
            .map(|group| GroupInfo {
                name: group.name,
                consumers: group.consumers,
                last_delivered_id: group.last_delivered_id,
            })
            .collect())
    }

    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool> {
        let destroyed: i64 = self
            .query(redis::cmd("XGROUP").arg("DESTROY").arg(key).arg(group))
            .await?;
        Ok(destroyed > 0)
    }

    async fn delete_key(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: i64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(exists > 0)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(usize, usize)>,
    ) -> Result<Vec<ScoredMember>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .arg("WITHSCORES");
        if let Some((offset, count)) = limit {
            cmd.arg("LIMIT").arg(offset).arg(count);
        }
        let members: Vec<(String, f64)> = self.query(&cmd).await?;
        Ok(members
            .into_iter()
            .map(|(member, score)| ScoredMember {
                member,
                score: score as i64,
            })
            .collect())
    }

    async fn increment_score(&self, key: &str, delta: i64, member: &str) -> Result<i64> {
        let score: f64 = self
            .query(redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member))
            .await?;
        Ok(score as i64)
    }

    async fn duplicate(&self) -> Result<Arc<dyn StreamStore>> {
        Ok(Arc::new(Self::open(Arc::clone(&self.target)).await?))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.lock().await.take().is_some() {
            debug!("Closed Redis connection");
        }
        Ok(())
    }
}

//! Integration tests for sharded group resolution.

use channelhouse_client::{ChannelError, Channels, ConsumeOptions, DirectoryError};
use channelhouse_core::shard_of;
use channelhouse_store::{MemoryStore, StoreError, StreamStore};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn sharded(slots: u32) -> (Arc<MemoryStore>, Channels) {
    let store = Arc::new(MemoryStore::new());
    let channels = Channels::builder()
        .sharded(true)
        .slots(slots)
        .store(store.clone())
        .build()
        .unwrap();
    (store, channels)
}

async fn scores(channels: &Channels) -> Vec<i64> {
    channels
        .directory()
        .load()
        .await
        .unwrap()
        .into_iter()
        .map(|member| member.score)
        .collect()
}

#[tokio::test]
async fn test_resolution_is_idempotent() {
    let (_store, channels) = sharded(32);
    let first = channels.use_group("orders").await.unwrap();
    let second = channels.use_group("orders").await.unwrap();

    assert_eq!(first.key(), second.key());
    assert_eq!(scores(&channels).await.iter().sum::<i64>(), 1);
}

#[tokio::test]
async fn test_second_group_takes_next_empty_shard() {
    let (_store, channels) = sharded(32);
    let a = channels.use_group("a").await.unwrap();
    let b = channels.use_group("b").await.unwrap();

    assert_eq!(a.key(), "app-channels-1|{10}a[0]");
    assert_eq!(b.key(), "app-channels-1|{113}b[1]");
}

#[tokio::test]
async fn test_concurrent_first_use_initializes_once() {
    let (_store, channels) = sharded(32);
    let groups: Vec<String> = (0..8).map(|i| format!("race-{i}")).collect();

    // Every call may find the index empty and initialize it.
    let tunnels = join_all(groups.iter().map(|group| channels.use_group(group))).await;
    for tunnel in &tunnels {
        let tunnel = tunnel.as_ref().unwrap();
        assert!(shard_of(tunnel.key()).is_some());
    }

    let scores = scores(&channels).await;
    assert_eq!(scores.len(), 32);
    assert_eq!(scores.iter().sum::<i64>(), groups.len() as i64);
}

#[tokio::test]
async fn test_even_distribution() {
    for slots in [32u32, 64] {
        let (_store, channels) = sharded(slots);
        for i in 0..(slots as usize + 9) {
            channels.use_group(&format!("group-{i}")).await.unwrap();
        }

        let scores = scores(&channels).await;
        assert_eq!(scores.len(), slots as usize);
        let min = scores.iter().min().unwrap();
        let max = scores.iter().max().unwrap();
        assert!(max - min <= 1, "uneven load for {slots} slots: {scores:?}");
        assert_eq!(scores.iter().sum::<i64>(), slots as i64 + 9);
    }
}

#[tokio::test]
async fn test_one_group_per_shard_uses_every_tag() {
    let (_store, channels) = sharded(64);
    let mut shards = HashSet::new();
    for i in 0..64 {
        let tunnel = channels.use_group(&format!("g{i}")).await.unwrap();
        shards.insert(shard_of(tunnel.key()).unwrap());
    }
    assert_eq!(shards.len(), 64);
}

#[tokio::test]
async fn test_new_group_takes_lowest_loaded_shard() {
    let (_store, channels) = sharded(32);
    let mut released_shard = None;
    for i in 0..32 {
        let tunnel = channels.use_group(&format!("g{i}")).await.unwrap();
        if i == 7 {
            released_shard = shard_of(tunnel.key());
        }
    }

    channels.delete_group("g7").await.unwrap();
    let fresh = channels.use_group("fresh").await.unwrap();
    assert_eq!(shard_of(fresh.key()), released_shard);
}

#[tokio::test]
async fn test_delete_releases_assignment() {
    let (store, channels) = sharded(32);
    let mut tunnel = channels.use_group("temp").await.unwrap();
    channels
        .subscribe(&mut tunnel, Some("team"), Some("c1"))
        .await
        .unwrap();
    channels.produce(&tunnel, "x").await.unwrap();

    let consumption = channels
        .consume(
            &tunnel,
            ConsumeOptions::default().timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    channels.delete_group("temp").await.unwrap();
    drop(consumption);

    assert!(!store.exists(tunnel.key()).await.unwrap());
    assert_eq!(channels.directory().lookup("temp").await.unwrap(), None);
    assert!(scores(&channels).await.iter().all(|score| *score == 0));

    // A later use assigns the group afresh.
    let again = channels.use_group("temp").await.unwrap();
    assert!(shard_of(again.key()).is_some());

    channels.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_delete_unknown_group() {
    let (_store, channels) = sharded(32);
    let err = channels.delete_group("never-used").await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Directory {
            sharded: true,
            source: DirectoryError::UnknownGroup,
            ..
        }
    ));
}

#[tokio::test]
async fn test_store_failure_during_resolve() {
    let (store, channels) = sharded(32);
    store.set_offline(true);
    let err = channels.use_group("orders").await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Directory {
            source: DirectoryError::Store(StoreError::Connection(_)),
            ..
        }
    ));
}

#[test]
fn test_invalid_slot_counts() {
    for slots in [0u32, 16, 31, 33, 63, 128] {
        let result = Channels::builder()
            .sharded(true)
            .slots(slots)
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(matches!(result, Err(ChannelError::Config(_))), "{slots}");
    }
}

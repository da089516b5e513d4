//! Integration tests for team mode (competing consumers).
//!
//! A team shares one consumer group: every message is delivered to exactly
//! one member, and unsubscribe requests reaching the wrong member are passed
//! on until the addressed member sees them.

use channelhouse_client::{Channels, ConsumeOptions, Consumption, Tunnel};
use channelhouse_store::{MemoryStore, StreamStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn setup() -> (Arc<MemoryStore>, Channels) {
    let store = Arc::new(MemoryStore::new());
    let channels = Channels::builder().store(store.clone()).build().unwrap();
    (store, channels)
}

fn fast() -> ConsumeOptions {
    ConsumeOptions::default()
        .timeout(Duration::from_millis(100))
        .count(5)
}

/// Drains a consumption on its own task, returning the delivered payloads.
fn collector(mut consumption: Consumption) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut payloads = Vec::new();
        while let Some(batch) = consumption.next_batch().await {
            for message in batch.expect("consume failed") {
                let data = message.data.expect("delivered message without data");
                payloads.push(String::from_utf8(data.to_vec()).unwrap());
            }
        }
        payloads
    })
}

async fn unsubscribe_entries(store: &MemoryStore, key: &str) -> usize {
    store
        .entries(key)
        .await
        .iter()
        .filter(|entry| entry.fields[0].0.contains(r#""context":"unsubscribe""#))
        .count()
}

async fn member(channels: &Channels, group: &str, team: &str, consumer: &str) -> Tunnel {
    let mut tunnel = channels.use_group(group).await.unwrap();
    channels
        .subscribe(&mut tunnel, Some(team), Some(consumer))
        .await
        .unwrap();
    tunnel
}

#[tokio::test]
async fn test_competing_consumers_split_messages() {
    let (store, channels) = setup();
    let members = vec![
        member(&channels, "jobs", "workers", "w1").await,
        member(&channels, "jobs", "workers", "w2").await,
        member(&channels, "jobs", "workers", "w3").await,
    ];

    let mut collectors = Vec::new();
    for tunnel in &members {
        let consumption = channels.consume(tunnel, fast()).await.unwrap();
        collectors.push(collector(consumption));
    }

    for i in 0..30 {
        channels
            .produce(&members[0], format!("job-{i}"))
            .await
            .unwrap();
    }

    // One member at a time, so each request has a single live addressee.
    let mut delivered = Vec::new();
    for (tunnel, handle) in members.iter().zip(collectors) {
        channels.unsubscribe(tunnel).await.unwrap();
        let payloads = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("member did not leave within 10s")
            .unwrap();
        delivered.extend(payloads);
    }

    assert_eq!(delivered.len(), 30);
    let unique: HashSet<_> = delivered.iter().cloned().collect();
    let expected: HashSet<_> = (0..30).map(|i| format!("job-{i}")).collect();
    assert_eq!(unique, expected);

    assert_eq!(unsubscribe_entries(&store, members[0].key()).await, 0);
    assert!(channels.registry().is_empty().await);
    channels.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_teammate_request_is_forwarded() {
    let (store, channels) = setup();
    let idle = member(&channels, "relay", "team", "idle").await;
    let busy = member(&channels, "relay", "team", "busy").await;

    let busy_collector = collector(channels.consume(&busy, fast()).await.unwrap());

    // Only "busy" is reading, so it receives the request for "idle" and must
    // pass it on rather than act on it.
    channels.unsubscribe(&idle).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(channels.registry().contains("busy").await);

    let idle_collector = collector(channels.consume(&idle, fast()).await.unwrap());
    tokio::time::timeout(Duration::from_secs(10), idle_collector)
        .await
        .expect("forwarded request never reached its consumer")
        .unwrap();
    assert!(!channels.registry().contains("idle").await);
    assert!(channels.registry().contains("busy").await);

    // Copies still in flight for the retired member are dropped, not passed on.
    let key = busy.key().to_string();
    let mut remaining = unsubscribe_entries(&store, &key).await;
    for _ in 0..50 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = unsubscribe_entries(&store, &key).await;
    }
    assert_eq!(remaining, 0);

    channels.produce(&busy, "still here").await.unwrap();
    channels.unsubscribe(&busy).await.unwrap();
    let payloads = tokio::time::timeout(Duration::from_secs(10), busy_collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payloads, vec!["still here".to_string()]);

    channels.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_other_teams_requests_are_ignored() {
    let (_store, channels) = setup();
    let billing = member(&channels, "orders", "billing", "b1").await;
    let shipping = member(&channels, "orders", "shipping", "s1").await;

    let billing_collector = collector(channels.consume(&billing, fast()).await.unwrap());
    let shipping_collector = collector(channels.consume(&shipping, fast()).await.unwrap());

    channels.produce(&billing, "order-1").await.unwrap();
    channels.unsubscribe(&billing).await.unwrap();
    let billed = tokio::time::timeout(Duration::from_secs(10), billing_collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(billed, vec!["order-1".to_string()]);

    // Both teams see every message; shipping keeps running.
    channels.produce(&shipping, "order-2").await.unwrap();
    channels.unsubscribe(&shipping).await.unwrap();
    let shipped = tokio::time::timeout(Duration::from_secs(10), shipping_collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        shipped,
        vec!["order-1".to_string(), "order-2".to_string()]
    );

    channels.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_last_member_destroys_group() {
    let (store, channels) = setup();
    let tunnel = member(&channels, "solo-team", "team", "only").await;
    let handle = collector(channels.consume(&tunnel, fast()).await.unwrap());

    channels.unsubscribe(&tunnel).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();

    let groups = store.list_groups(tunnel.key()).await.unwrap();
    assert!(groups.iter().all(|group| group.name != "team"));

    channels.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_explicit_start_id_goes_live_after_history() {
    let (_store, channels) = setup();
    let tunnel = member(&channels, "history", "team", "h1").await;
    let options = ConsumeOptions::default()
        .timeout(Duration::from_millis(200))
        .from_id("0-0")
        .message_on_timeout(true);
    let mut consumption = channels.consume(&tunnel, options).await.unwrap();

    // Idle reads block for the full timeout instead of returning at once.
    let started = tokio::time::Instant::now();
    let mut timeouts = 0;
    while started.elapsed() < Duration::from_millis(500) {
        let batch = tokio::time::timeout(Duration::from_secs(5), consumption.next_batch())
            .await
            .expect("no batch within 5s")
            .expect("consumption ended")
            .expect("consume failed");
        assert!(batch.iter().all(|message| message.data.is_none()));
        timeouts += batch.len();
    }
    assert!(
        (1..=4).contains(&timeouts),
        "{timeouts} timeout batches in 500ms with a 200ms timeout"
    );

    channels.produce(&tunnel, "x").await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let batch = consumption
                .next_batch()
                .await
                .expect("consumption ended")
                .expect("consume failed");
            if let Some(message) = batch.into_iter().find(|m| m.data.is_some()) {
                return message;
            }
        }
    })
    .await
    .expect("produced message was not delivered");
    assert_eq!(delivered.data.as_deref(), Some(&b"x"[..]));

    drop(consumption);
    channels.cleanup().await.unwrap();
}

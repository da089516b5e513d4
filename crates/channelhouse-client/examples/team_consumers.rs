//! Team Consumers Demo
//!
//! Three workers share the team "workers" on the sharded group "jobs" and
//! split twenty jobs between them. Each worker then leaves through the
//! unsubscribe protocol.
//!
//! Runs against the in-process store:
//!
//! ```text
//! RUST_LOG=channelhouse_client=debug cargo run -p channelhouse-client --example team_consumers
//! ```

use channelhouse_client::{Channels, ConsumeOptions};
use channelhouse_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let channels = Channels::builder()
        .application("demo")
        .sharded(true)
        .store(Arc::new(MemoryStore::new()))
        .build()?;

    let mut workers = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let mut tunnel = channels.use_group("jobs").await?;
        channels
            .subscribe(&mut tunnel, Some("workers"), Some(name))
            .await?;
        println!("✓ {} subscribed to {}", name, tunnel.key());
        workers.push((name, tunnel));
    }

    let mut handles = Vec::new();
    for (name, tunnel) in &workers {
        let options = ConsumeOptions::default().timeout(Duration::from_millis(500));
        let mut consumption = channels.consume(tunnel, options).await?;
        let name = name.to_string();
        handles.push(tokio::spawn(async move {
            let mut done = 0;
            while let Some(batch) = consumption.next_batch().await {
                for message in batch? {
                    if let Some(data) = message.data {
                        println!("  {} ← {}", name, String::from_utf8_lossy(&data));
                        done += 1;
                    }
                }
            }
            Ok::<_, channelhouse_client::ChannelError>((name, done))
        }));
    }

    let producer = &workers[0].1;
    for i in 0..20 {
        channels.produce(producer, format!("job-{i}")).await?;
    }

    for ((_, tunnel), handle) in workers.iter().zip(handles) {
        channels.unsubscribe(tunnel).await?;
        let (name, done) = handle.await??;
        println!("✓ {} left after {} jobs", name, done);
    }

    for shard in channels.directory().load().await? {
        if shard.score > 0 {
            println!("shard {} carries {} group(s)", shard.member, shard.score);
        }
    }

    channels.cleanup().await?;
    Ok(())
}

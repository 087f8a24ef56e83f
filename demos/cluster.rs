//! Example: a small bot on top of gateway-cluster
//!
//! Connects every recommended shard, logs incoming messages, reacts to
//! `!ping`, and stores the session snapshot on Ctrl+C so the next run
//! resumes instead of identifying again.
//!
//! Run with: DISCORD_TOKEN=... cargo run --example cluster

use gateway_cluster::{
    handler_fn, intents, ApiClient, Cluster, ClusterConfig, ClusterSnapshot, GatewayEvent,
    HandlerError, MessageRequest, RestConfig, Shard,
};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SNAPSHOT_PATH: &str = "cluster-snapshot.json";

fn load_snapshot(path: &Path) -> Option<ClusterSnapshot> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN")?;

    let api = ApiClient::new(RestConfig::builder(&token).build()?)?;
    let info = api.get_gateway_bot().await?;
    info!(
        "Gateway recommends {} shards (max concurrency {})",
        info.shards, info.session_start_limit.max_concurrency
    );

    let config = ClusterConfig::builder(&token)
        .intents(intents::GUILDS | intents::GUILD_MESSAGES | intents::MESSAGE_CONTENT)
        .build()?;

    let replies = api.clone();
    let handler = handler_fn(move |shard: Shard, event: GatewayEvent| {
        let api = replies.clone();
        async move {
            match event {
                GatewayEvent::Ready(ready) => {
                    info!("[SHARD-{}] Ready as {}", shard.id(), ready.user.username);
                }
                GatewayEvent::MessageCreate(message) if !message.author.bot => {
                    info!(
                        "[SHARD-{}] #{} {}: {}",
                        shard.id(),
                        message.channel_id,
                        message.author.username,
                        message.content
                    );
                    if message.content == "!ping" {
                        let latency = shard
                            .latency()
                            .map(|l| format!("{:?}", l))
                            .unwrap_or_else(|| "?".to_string());
                        let reply = MessageRequest::text(format!("pong ({})", latency));
                        api.create_message(message.channel_id, reply, Vec::new())
                            .await?;
                    }
                }
                _ => {}
            }
            Ok::<(), HandlerError>(())
        }
    });

    let cluster = Cluster::new(config, handler);
    let snapshot = load_snapshot(Path::new(SNAPSHOT_PATH));
    let plan = cluster.start_from_gateway_info(&info, snapshot.as_ref()).await?;
    info!("Cluster started ({:?}) with {} shards", plan, cluster.shard_count());

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    // Graceful shutdown
    cluster.stop().await?;
    std::fs::write(SNAPSHOT_PATH, serde_json::to_vec_pretty(&cluster.snapshot())?)?;

    // Print final metrics
    let snapshot = cluster.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Events dispatched: {}", snapshot.events_dispatched_total);
    for route in api.rest().metrics().route_metrics() {
        info!(
            "  {} -> {}: {} responses (avg {:?})",
            route.route,
            route.status,
            route.count,
            route.average_latency()
        );
    }

    Ok(())
}

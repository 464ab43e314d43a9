//! Headless watcher binary.
//!
//! Loads a topology snapshot, attaches the sync core to an event-stream
//! endpoint, and logs entity status transitions until interrupted.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use topowatch::{
    ConnectionManager, GraphStore, LiveMode, Reconciler, Status, SubscriptionRegistry, SyncConfig,
    TcpConnector,
};

#[derive(Parser, Debug)]
#[command(name = "topowatch")]
#[command(about = "Watch a message-broker topology graph over a live event stream")]
struct Args {
    /// Event-stream endpoint (host:port)
    #[arg(short, long)]
    connect: String,

    /// Topology snapshot JSON (nodes + edges) from the graph constructor
    #[arg(short, long)]
    graph: PathBuf,

    /// Optional config file with timing and channel settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Heartbeat interval in seconds (overrides the config file)
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Delay between reconnect attempts, in seconds (overrides the config file)
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Reconnect attempts per outage before giving up (overrides the config file)
    #[arg(long)]
    retries: Option<u32>,

    /// Disable live-update mode (suppresses edge animation)
    #[arg(long)]
    no_live: bool,

    /// Write the final graph snapshot to this file on exit
    #[arg(short, long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    apply_flag_overrides(&mut config, &args);

    let raw = fs::read_to_string(&args.graph)
        .with_context(|| format!("reading graph snapshot {}", args.graph.display()))?;
    let store = GraphStore::from_json(&raw).context("parsing graph snapshot")?;
    info!(
        nodes = store.node_count(),
        edges = store.edge_count(),
        "graph loaded"
    );

    let live = LiveMode::new(!args.no_live);
    let (reconciler, mut snapshots) = Reconciler::new(store, live);
    let (events, queue) = mpsc::channel(256);
    tokio::spawn(reconciler.run(queue));

    let channels = config.channels.clone();
    let manager = ConnectionManager::new(
        Arc::new(TcpConnector::new(&args.connect)),
        Arc::new(SubscriptionRegistry::new()),
        config,
    );
    for channel in channels.all() {
        manager.subscribe(channel, events.clone()).await;
    }

    let mut states = manager.states();
    tokio::spawn(async move {
        while let Ok(state) = states.recv().await {
            info!(state = state.label(), "connection");
        }
    });

    manager
        .connect()
        .await
        .with_context(|| format!("connecting to {}", args.connect))?;

    // Track status tiers across snapshots so activity is summarized per
    // change instead of per event.
    let mut tiers: HashMap<Status, usize> = count_tiers(&snapshots.borrow());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = count_tiers(&snapshots.borrow());
                if next != tiers {
                    info!(
                        active = next.get(&Status::Active).copied().unwrap_or(0),
                        connected = next.get(&Status::Connected).copied().unwrap_or(0),
                        inactive = next.get(&Status::Inactive).copied().unwrap_or(0),
                        "topology activity"
                    );
                    tiers = next;
                }
            }
        }
    }

    info!("shutting down");
    manager.disconnect().await;

    if let Some(path) = &args.export {
        let json = snapshots.borrow().to_json().context("serializing snapshot")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "snapshot exported");
    }
    Ok(())
}

/// Layer explicit command-line flags over the loaded configuration.
/// A flag that was not given leaves the file (or default) value alone.
fn apply_flag_overrides(config: &mut SyncConfig, args: &Args) {
    if let Some(secs) = args.heartbeat {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.retry_delay {
        config.reconnect_delay = Duration::from_secs(secs);
    }
    if let Some(attempts) = args.retries {
        config.max_reconnect_attempts = attempts;
    }
}

fn count_tiers(snapshot: &topowatch::GraphSnapshot) -> HashMap<Status, usize> {
    let mut tiers = HashMap::new();
    for node in snapshot.nodes.values() {
        *tiers.entry(node.status).or_insert(0) += 1;
    }
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["topowatch", "--connect", "localhost:9090", "--graph", "g.json"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn omitted_flags_keep_file_timings() {
        let mut config = SyncConfig {
            heartbeat_interval: Duration::from_millis(1500),
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_attempts: 2,
            ..SyncConfig::default()
        };
        apply_flag_overrides(&mut config, &parse(&[]));

        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 2);
    }

    #[test]
    fn given_flags_win_over_file_timings() {
        let mut config = SyncConfig {
            heartbeat_interval: Duration::from_millis(1500),
            ..SyncConfig::default()
        };
        apply_flag_overrides(
            &mut config,
            &parse(&["--heartbeat", "3", "--retry-delay", "1", "--retries", "9"]),
        );

        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 9);
    }
}

//! Session timing and channel configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Names of the logical feeds the dashboard observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedChannels {
    /// Topic create/update notifications.
    pub topic_update: String,
    /// Periodic topic metrics (throughput, counters, consumer flags).
    pub topic_metrics: String,
    /// Per-message arrival notifications.
    pub message_arrival: String,
}

impl Default for FeedChannels {
    fn default() -> Self {
        Self {
            topic_update: "topics.update".to_string(),
            topic_metrics: "topics.metrics".to_string(),
            message_arrival: "topics.messages".to_string(),
        }
    }
}

impl FeedChannels {
    /// All feed names, in subscription order.
    pub fn all(&self) -> [&str; 3] {
        [&self.topic_update, &self.topic_metrics, &self.message_arrival]
    }
}

/// Configuration for the connection manager and session loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between outbound heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// Number of unacknowledged pings tolerated before the session is
    /// considered lost.
    pub heartbeat_missed_limit: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Reconnect attempts per outage before giving up.
    pub max_reconnect_attempts: u32,
    /// How long to wait for the CONNECTED reply during the handshake.
    pub handshake_timeout: Duration,
    /// Feed channel names.
    pub channels: FeedChannels,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_missed_limit: 2,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            handshake_timeout: Duration::from_secs(5),
            channels: FeedChannels::default(),
        }
    }
}

/// File representation of [`SyncConfig`]. All fields optional; anything
/// absent falls back to the default.
#[derive(Debug, Default, Deserialize)]
struct RawSyncConfig {
    heartbeat_interval_ms: Option<u64>,
    heartbeat_missed_limit: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    handshake_timeout_ms: Option<u64>,
    channels: Option<FeedChannels>,
}

impl SyncConfig {
    /// Load configuration from a file, layering it over the defaults.
    ///
    /// Any format the `config` crate understands works (TOML, JSON, YAML);
    /// the format is inferred from the extension.
    pub fn from_file(path: &Path) -> Result<Self, config::ConfigError> {
        let raw: RawSyncConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;

        let mut cfg = Self::default();
        if let Some(ms) = raw.heartbeat_interval_ms {
            cfg.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = raw.heartbeat_missed_limit {
            cfg.heartbeat_missed_limit = limit;
        }
        if let Some(ms) = raw.reconnect_delay_ms {
            cfg.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = raw.max_reconnect_attempts {
            cfg.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = raw.handshake_timeout_ms {
            cfg.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(channels) = raw.channels {
            cfg.channels = channels;
        }
        Ok(cfg)
    }
}

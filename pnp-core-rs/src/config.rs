//! Configuration for the coordinator and actuator nodes
//!
//! Every struct has working defaults, `with_*` builders for code and tests,
//! and loads from a JSON file where missing fields keep their defaults.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feeder::{max_strokes, FeederSettings, MAX_FEED_LENGTH};
use crate::link::DEFAULT_PORT;
use crate::types::{FeederId, NodeHandle};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// UDP link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local bind address
    pub bind: SocketAddr,
    /// Every packet is sent to each of these
    pub fanout: Vec<SocketAddr>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            fanout: vec![SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                DEFAULT_PORT,
            ))],
        }
    }
}

/// Completion bounds for routed commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound for non-feed commands and the floor for feeds
    pub command_timeout_ms: u64,
    /// Extra allowance per unit of feed length
    pub feed_timeout_per_unit_ms: u64,
    pub feed_timeout_max_ms: u64,
    /// Fresh-snapshot wait for queries before using the cache
    pub query_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3000,
            feed_timeout_per_unit_ms: 200,
            feed_timeout_max_ms: 15000,
            query_timeout_ms: 1000,
        }
    }
}

impl DispatchConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// `base + per_unit * length`, raised to cover the worst-case stroke
    /// count at `settle_time_ms` per stroke, clamped to `[base, max]`.
    /// An unspecified length assumes the longest feed.
    pub fn feed_timeout(&self, length: Option<u8>, settle_time_ms: u64) -> Duration {
        let length = length.unwrap_or(MAX_FEED_LENGTH);
        let per_unit = self
            .feed_timeout_per_unit_ms
            .saturating_mul(u64::from(length));
        let motion = max_strokes(length).saturating_mul(settle_time_ms);
        let base = self.command_timeout_ms;
        let max = self.feed_timeout_max_ms.max(base);
        let ms = base
            .saturating_add(per_unit.max(motion))
            .clamp(base, max);
        Duration::from_millis(ms)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub link: LinkConfig,
    pub dispatch: DispatchConfig,
    /// Entries silent for longer than this are stale
    pub liveness_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Slots in the unassigned-node list
    pub max_unassigned: usize,
    /// Window in which an unassigned node is listed
    pub unassigned_window_ms: u64,
    /// Start with motion enabled instead of waiting for `M610 S1`
    pub start_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            dispatch: DispatchConfig::default(),
            liveness_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            max_unassigned: 10,
            unassigned_window_ms: 60_000,
            start_enabled: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.max_unassigned == 0 {
            return Err(ConfigError::Invalid("max_unassigned must be positive".into()));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn unassigned_window(&self) -> Duration {
        Duration::from_millis(self.unassigned_window_ms)
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_start_enabled(mut self, enabled: bool) -> Self {
        self.start_enabled = enabled;
        self
    }
}

/// Manual-feed button handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualFeedConfig {
    pub min_pulse_ms: u64,
    pub max_pulse_ms: u64,
    /// Also run a forced local feed when the button is accepted
    pub advance: bool,
}

impl Default for ManualFeedConfig {
    fn default() -> Self {
        Self {
            min_pulse_ms: 10,
            max_pulse_ms: 30,
            advance: true,
        }
    }
}

impl ManualFeedConfig {
    pub fn min_pulse(&self) -> Duration {
        Duration::from_millis(self.min_pulse_ms)
    }

    pub fn max_pulse(&self) -> Duration {
        Duration::from_millis(self.max_pulse_ms)
    }
}

/// Actuator node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub handle: NodeHandle,
    /// Operator-assigned identity; `None` announces as unassigned
    pub feeder_id: Option<u8>,
    pub link: LinkConfig,
    pub settings: FeederSettings,
    pub feedback_enabled: bool,
    pub poll_interval_ms: u64,
    pub announce_interval_ms: u64,
    pub discovery_backoff_max_ms: u64,
    /// Spread of `REGISTER` replies to a coordinator `HEARTBEAT`
    pub heartbeat_reply_max_ms: u64,
    pub manual_feed: ManualFeedConfig,
    /// File this config was loaded from; identity changes are written back
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handle: NodeHandle::random(),
            feeder_id: None,
            link: LinkConfig::default(),
            settings: FeederSettings::default(),
            feedback_enabled: true,
            poll_interval_ms: 10,
            announce_interval_ms: 10_000,
            discovery_backoff_max_ms: 2000,
            heartbeat_reply_max_ms: 500,
            manual_feed: ManualFeedConfig::default(),
            source: None,
        }
    }
}

impl NodeConfig {
    pub fn new(handle: NodeHandle) -> Self {
        Self {
            handle,
            ..Default::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = read_json(path)?;
        config.validate()?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Write the config back to the file it came from
    pub fn persist(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(raw) = self.feeder_id {
            FeederId::new(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        self.settings
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.poll_interval_ms == 0 || self.announce_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.manual_feed.min_pulse_ms > self.manual_feed.max_pulse_ms {
            return Err(ConfigError::Invalid("manual pulse window is empty".into()));
        }
        Ok(())
    }

    pub fn feeder(&self) -> Option<FeederId> {
        self.feeder_id.and_then(|raw| FeederId::new(raw).ok())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn discovery_backoff_max(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_max_ms)
    }

    pub fn heartbeat_reply_max(&self) -> Duration {
        Duration::from_millis(self.heartbeat_reply_max_ms)
    }

    pub fn with_feeder_id(mut self, feeder: FeederId) -> Self {
        self.feeder_id = Some(feeder.get());
        self
    }

    pub fn with_settings(mut self, settings: FeederSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_feedback(mut self, enabled: bool) -> Self {
        self.feedback_enabled = enabled;
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_manual_feed(mut self, manual_feed: ManualFeedConfig) -> Self {
        self.manual_feed = manual_feed;
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_discovery_backoff_max(mut self, max: Duration) -> Self {
        self.discovery_backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_reply_max(mut self, max: Duration) -> Self {
        self.heartbeat_reply_max_ms = max.as_millis() as u64;
        self
    }
}

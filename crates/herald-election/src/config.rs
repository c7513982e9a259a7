//! Election configuration management

use crate::error::{ElectionError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted value for any timing field
pub const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing and naming parameters shared by every peer of a coordination group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Prefix of every key this group writes to the broadcast store
    pub namespace: String,

    /// Log protocol steps at INFO instead of DEBUG
    pub debug: bool,

    /// Maximum leader silence before followers presume it dead
    pub heartbeat_ttl: Duration,

    /// Base delay added to every heartbeat-timeout wait
    pub heartbeat_offset: Duration,

    /// Upper bound of the random extra delay each peer adds to `heartbeat_offset`
    pub heartbeat_jitter: Duration,

    /// How long a round stays open for votes
    pub election_time: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            namespace: "_herald".to_string(),
            debug: true,
            heartbeat_ttl: Duration::from_millis(2000),
            heartbeat_offset: Duration::from_millis(500),
            heartbeat_jitter: Duration::from_millis(10),
            election_time: Duration::from_millis(2000),
        }
    }
}

impl ElectionConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ElectionError::configuration(format!("Failed to read config file: {}", e))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        std::fs::write(path, content).map_err(|e| {
            ElectionError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    pub fn with_namespace<T: Into<String>>(mut self, namespace: T) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_heartbeat_offset(mut self, offset: Duration) -> Self {
        self.heartbeat_offset = offset;
        self
    }

    pub fn with_heartbeat_jitter(mut self, jitter: Duration) -> Self {
        self.heartbeat_jitter = jitter;
        self
    }

    pub fn with_election_time(mut self, election_time: Duration) -> Self {
        self.election_time = election_time;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ElectionError::configuration("Namespace cannot be empty"));
        }

        if self.heartbeat_interval() < Duration::from_millis(1) {
            return Err(ElectionError::configuration(
                "Heartbeat TTL must be at least 2ms",
            ));
        }

        if self.election_time.is_zero() {
            return Err(ElectionError::configuration(
                "Election time must be greater than zero",
            ));
        }

        let timings = [
            ("Heartbeat TTL", self.heartbeat_ttl),
            ("Heartbeat offset", self.heartbeat_offset),
            ("Heartbeat jitter", self.heartbeat_jitter),
            ("Election time", self.election_time),
        ];
        for (name, value) in timings {
            if value > MAX_TIMING {
                return Err(ElectionError::configuration(format!(
                    "{} must not exceed {}s",
                    name,
                    MAX_TIMING.as_secs()
                )));
            }
        }

        Ok(())
    }

    /// Interval at which a master refreshes the heartbeat record
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_ttl / 2
    }

    /// Draw the per-peer heartbeat offset: the base offset plus uniform jitter
    pub fn draw_heartbeat_offset(&self) -> Duration {
        let jitter_ms = u64::try_from(self.heartbeat_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.heartbeat_offset;
        }

        let extra = rand::thread_rng().gen_range(0..jitter_ms);
        self.heartbeat_offset.saturating_add(Duration::from_millis(extra))
    }
}

/// Whole milliseconds of `duration`, clamped to `i64::MAX`
pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

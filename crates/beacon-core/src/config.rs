//! Broker configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*), applied to defaults
//! - TOML configuration file

use beacon_protocol::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How a shared group picks the member for the next message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharePolicy {
    /// Rotate over the members.
    #[default]
    RoundRobin,
    /// Pick the member whose session has the fewest in-flight deliveries.
    LeastInflight,
}

impl FromStr for SharePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(SharePolicy::RoundRobin),
            "least_inflight" => Ok(SharePolicy::LeastInflight),
            other => Err(ConfigError::Invalid(format!(
                "unknown shared subscription policy '{other}'"
            ))),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic configuration.
    #[serde(default)]
    pub topics: TopicConfig,

    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Shared subscription configuration.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Topic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Messages kept per topic log.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// In-flight window used when the client does not announce one.
    #[serde(default = "default_inflight_window")]
    pub inflight_window: usize,

    /// Upper bound for any client's in-flight window.
    #[serde(default = "default_max_inflight_window")]
    pub max_inflight_window: usize,
}

/// Shared subscription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Member selection policy.
    #[serde(default = "default_share_policy")]
    pub policy: SharePolicy,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Highest QoS granted to a subscription.
    #[serde(default = "default_max_qos")]
    pub max_qos: QoS,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

// Default value functions
fn default_log_capacity() -> usize {
    env_parse("BEACON_LOG_CAPACITY").unwrap_or(crate::log::DEFAULT_LOG_CAPACITY)
}

fn default_inflight_window() -> usize {
    env_parse("BEACON_INFLIGHT_WINDOW").unwrap_or(32)
}

fn default_max_inflight_window() -> usize {
    env_parse("BEACON_MAX_INFLIGHT_WINDOW").unwrap_or(1024)
}

fn default_share_policy() -> SharePolicy {
    env_parse("BEACON_SHARE_POLICY").unwrap_or_default()
}

fn default_max_topics() -> usize {
    env_parse("BEACON_MAX_TOPICS").unwrap_or(100_000)
}

fn default_max_qos() -> QoS {
    env_parse::<u8>("BEACON_MAX_QOS")
        .and_then(|value| QoS::try_from(value).ok())
        .unwrap_or(QoS::ExactlyOnce)
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inflight_window: default_inflight_window(),
            max_inflight_window: default_max_inflight_window(),
        }
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            policy: default_share_policy(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            max_qos: default_max_qos(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the first file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed
    /// or validated.
    pub fn load() -> Result<Self, ConfigError> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: BrokerConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.log_capacity == 0 {
            return Err(ConfigError::Invalid("topics.log_capacity must be at least 1".into()));
        }
        if self.session.max_inflight_window == 0
            || self.session.max_inflight_window > usize::from(u16::MAX)
        {
            return Err(ConfigError::Invalid(
                "session.max_inflight_window must be within 1..=65535".into(),
            ));
        }
        if self.session.inflight_window == 0
            || self.session.inflight_window > self.session.max_inflight_window
        {
            return Err(ConfigError::Invalid(
                "session.inflight_window must be within 1..=max_inflight_window".into(),
            ));
        }
        if self.limits.max_topics == 0 {
            return Err(ConfigError::Invalid("limits.max_topics must be at least 1".into()));
        }
        Ok(())
    }

    /// In-flight window for a client announcing `receive_maximum`.
    #[must_use]
    pub fn window_for(&self, receive_maximum: Option<u16>) -> usize {
        receive_maximum
            .map(usize::from)
            .unwrap_or(self.session.inflight_window)
            .clamp(1, self.session.max_inflight_window.max(1))
    }
}

//! Configuration module for the poll engine
//!
//! Loads the engine configuration from TOML and validates it before a
//! messaging service is allowed to start.

use std::collections::HashSet;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;
use crate::client::PriorityPartition;
use crate::errors::ConfigError;
use crate::poll_algorithm::PollAlgorithmConfig;
use crate::rate_limit::ResourceProfile;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Messaging service configuration
    pub service: MessagingServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for one messaging service (one channel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingServiceConfig {
    /// Channel the service listens on
    pub channel_id: String,

    /// Priority partitions, one listener client each
    pub partitions: Vec<PriorityPartition>,

    /// Poll algorithm knobs
    #[serde(default)]
    pub algorithm: PollAlgorithmConfig,

    /// Concurrency budget shared by all partitions
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,

    /// Pause between scheduling cycles in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Statistics window; capacity is reset when it elapses
    #[serde(default = "default_capacity_reset_interval_ms")]
    pub capacity_reset_interval_ms: u64,

    /// Client reset policy
    #[serde(default)]
    pub reset: ClientResetConfig,

    /// Optional rate limit applied per client
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Capacity of the outgoing message channel
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResetConfig {
    /// Consecutive poll exceptions that trigger a client reset
    #[serde(default = "default_exception_threshold")]
    pub exception_threshold: u32,

    /// Standoff between reset attempts
    #[serde(default)]
    pub backoff: ExponentialBackoff,
}

impl Default for ClientResetConfig {
    fn default() -> Self {
        Self {
            exception_threshold: default_exception_threshold(),
            backoff: ExponentialBackoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub profiles: Vec<ResourceProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

// Default value functions
fn default_max_concurrent_polls() -> usize { 32 }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_capacity_reset_interval_ms() -> u64 { 60_000 }
fn default_exception_threshold() -> u32 { 5 }
fn default_output_buffer() -> usize { 1024 }
fn default_log_filter() -> String { "fabric_poller=info,warn".to_string() }

impl MessagingServiceConfig {
    /// Service configuration with default knobs for the given partitions
    pub fn new(channel_id: impl Into<String>, partitions: Vec<PriorityPartition>) -> Self {
        Self {
            channel_id: channel_id.into(),
            partitions,
            algorithm: PollAlgorithmConfig::default(),
            max_concurrent_polls: default_max_concurrent_polls(),
            poll_interval_ms: default_poll_interval_ms(),
            capacity_reset_interval_ms: default_capacity_reset_interval_ms(),
            reset: ClientResetConfig::default(),
            rate_limit: None,
            output_buffer: default_output_buffer(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capacity_reset_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_reset_interval_ms)
    }

    /// Check everything that does not depend on a running fabric
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_id.trim().is_empty() {
            return Err(ConfigError::Validation("channel_id must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.priority) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate partition priority {} on channel {}",
                    partition.priority, self.channel_id
                )));
            }
            if partition.weighting <= Decimal::ZERO {
                return Err(ConfigError::Validation(format!(
                    "Invalid weighting for partition {}: must be > 0",
                    partition.priority
                )));
            }
        }

        if self.output_buffer == 0 {
            return Err(ConfigError::Validation("output_buffer must be > 0".to_string()));
        }

        self.algorithm.validate().map_err(ConfigError::Validation)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read config file {}: {}", path, e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(format!("Failed to parse TOML: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()
    }
}

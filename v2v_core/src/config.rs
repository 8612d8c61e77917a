//! Aggregate configuration for a V2V deployment.

use crate::protocol::ProtocolConfig;
use crate::proximity::ProximityConfig;
use crate::security::SecurityConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Every section is optional in JSON; missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct V2vConfig {
    pub security: SecurityConfig,
    pub proximity: ProximityConfig,
    pub protocol: ProtocolConfig,
}

impl V2vConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let s = &self.security;
        if s.kdf_iterations == 0 {
            return invalid("security.kdf_iterations must be positive");
        }
        if s.key_rotation_interval_secs == 0 {
            return invalid("security.key_rotation_interval_secs must be positive");
        }
        if s.kdf_salt.is_empty() {
            return invalid("security.kdf_salt must not be empty");
        }

        let p = &self.proximity;
        if !(p.max_range_m > 0.0) {
            return invalid("proximity.max_range_m must be positive");
        }
        if !(0.0..p.max_range_m).contains(&p.min_range_m) {
            return invalid("proximity.min_range_m must be in [0, max_range_m)");
        }
        if p.update_interval_ms == 0 {
            return invalid("proximity.update_interval_ms must be positive");
        }
        if !(p.movement_threshold_m >= 0.0) {
            return invalid("proximity.movement_threshold_m must not be negative");
        }

        let q = &self.protocol;
        if q.broadcast_interval_ms == 0 || q.heartbeat_interval_ms == 0 || q.cleanup_interval_secs == 0 {
            return invalid("protocol loop intervals must be positive");
        }
        if q.inbound_queue_capacity == 0 {
            return invalid("protocol.inbound_queue_capacity must be positive");
        }
        Ok(())
    }
}

//! Coordinator configuration
//!
//! Loaded from TOML; every field except `party_id` has a default.
//!
//! ```toml
//! party_id = "val-1"
//! coordinator_range = 100
//! poll_interval_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::{
    CONSECUTIVE_WAIT_THRESHOLD, DEFAULT_COMPLETED_HANDSHAKE_TTL_MS, DEFAULT_COORDINATOR_RANGE,
    DEFAULT_POLL_INTERVAL_MS, PER_CHAIN_CAP,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// This node's party id (validator address)
    pub party_id: String,
    /// Blocks per coordinator epoch
    pub coordinator_range: u64,
    pub poll_interval_ms: u64,
    /// Max unconfirmed SIGN transactions per destination chain
    pub per_chain_cap: usize,
    /// Ticks a busy chain waits before its nonce stream is treated as stuck
    pub consecutive_wait_threshold: u32,
    /// Max confirmed events fetched per tick
    pub event_batch_limit: usize,
    /// Blocks an event must age before it is processed
    pub min_event_age_blocks: u64,
    /// Accepted gas price deviation from the local oracle, in percent
    pub gas_price_tolerance_percent: u32,
    /// How long a completed handshake blocks a new setup for the same event
    pub completed_handshake_ttl_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            party_id: String::new(),
            coordinator_range: DEFAULT_COORDINATOR_RANGE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            per_chain_cap: PER_CHAIN_CAP,
            consecutive_wait_threshold: CONSECUTIVE_WAIT_THRESHOLD,
            event_batch_limit: 100,
            min_event_age_blocks: 10,
            gas_price_tolerance_percent: 10,
            completed_handshake_ttl_ms: DEFAULT_COMPLETED_HANDSHAKE_TTL_MS,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(party_id: impl Into<String>) -> Self {
        Self {
            party_id: party_id.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.party_id.trim().is_empty() {
            return Err(ConfigError::Invalid("party_id is required".into()));
        }
        if self.coordinator_range == 0 {
            return Err(ConfigError::Invalid("coordinator_range must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.per_chain_cap == 0 {
            return Err(ConfigError::Invalid("per_chain_cap must be positive".into()));
        }
        if self.event_batch_limit == 0 {
            return Err(ConfigError::Invalid("event_batch_limit must be positive".into()));
        }
        if self.completed_handshake_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "completed_handshake_ttl_ms must be positive".into(),
            ));
        }
        if !(1..=100).contains(&self.gas_price_tolerance_percent) {
            return Err(ConfigError::Invalid(format!(
                "gas_price_tolerance_percent must be in 1..=100, got {}",
                self.gas_price_tolerance_percent
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completed_handshake_ttl(&self) -> Duration {
        Duration::from_millis(self.completed_handshake_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::new("val-1");
        assert_eq!(config.coordinator_range, 100);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.per_chain_cap, 16);
        assert_eq!(config.consecutive_wait_threshold, 20);
        assert_eq!(config.completed_handshake_ttl(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
            party_id = "val-2"
            coordinator_range = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.party_id, "val-2");
        assert_eq!(config.coordinator_range, 50);
        assert_eq!(config.event_batch_limit, 100);
        assert_eq!(config.min_event_age_blocks, 10);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(matches!(
            CoordinatorConfig::from_toml_str("coordinator_range = 5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoordinatorConfig::from_toml_str("party_id = \"v\"\ncoordinator_range = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoordinatorConfig::from_toml_str("party_id = \"v\"\ngas_price_tolerance_percent = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoordinatorConfig::from_toml_str("party_id = \"v\"\ncompleted_handshake_ttl_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoordinatorConfig::from_toml_str("party_id = 7"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "party_id = \"val-3\"").unwrap();
        writeln!(file, "per_chain_cap = 4").unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.party_id, "val-3");
        assert_eq!(config.per_chain_cap, 4);

        let missing = CoordinatorConfig::load("/nonexistent/tss.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}

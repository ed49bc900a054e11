//! Client configuration
//!
//! All values have working defaults; a JSON file may override any subset.
//! Durations are written as whole seconds.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for circuit construction and path selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Link protocol versions offered in VERSIONS
    pub link_versions: Vec<u16>,

    /// Bound on any single wait for a cell
    #[serde(with = "duration_secs")]
    pub cell_timeout: Duration,

    /// Bound on building a whole circuit
    #[serde(with = "duration_secs")]
    pub circuit_build_timeout: Duration,

    /// Attempts made by `create_default_circuit` before giving up
    pub circuit_build_attempts: u32,

    /// SENDME version sent for circuit-level acknowledgements
    pub sendme_version: u8,

    /// Circuit package/deliver window
    pub circuit_window: u32,

    /// Guards kept in the sampled set
    pub guard_sample_size: usize,

    /// Guards kept in the primary set
    pub primary_guards: usize,

    /// Slots in the second vanguard layer
    pub vanguard_layer_size: usize,

    /// Shortest vanguard lifetime
    #[serde(with = "duration_secs")]
    pub vanguard_min_lifetime: Duration,

    /// Longest vanguard lifetime
    #[serde(with = "duration_secs")]
    pub vanguard_max_lifetime: Duration,
}

const DAY: u64 = 24 * 60 * 60;

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            link_versions: vec![4, 5],
            cell_timeout: Duration::from_secs(30),
            circuit_build_timeout: Duration::from_secs(60),
            circuit_build_attempts: 5,
            sendme_version: 1,
            circuit_window: 1000,
            guard_sample_size: 20,
            primary_guards: 2,
            vanguard_layer_size: 4,
            vanguard_min_lifetime: Duration::from_secs(3 * DAY),
            vanguard_max_lifetime: Duration::from_secs(14 * DAY),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TorError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!("📄 Loaded client config from {}", path.display());
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.link_versions.is_empty() {
            return Err(TorError::Config("link_versions must not be empty".into()));
        }
        if self.circuit_build_attempts == 0 {
            return Err(TorError::Config("circuit_build_attempts must be > 0".into()));
        }
        if self.primary_guards == 0 || self.primary_guards > self.guard_sample_size {
            return Err(TorError::Config(
                "primary_guards must be between 1 and guard_sample_size".into(),
            ));
        }
        if self.vanguard_min_lifetime > self.vanguard_max_lifetime {
            return Err(TorError::Config(
                "vanguard_min_lifetime exceeds vanguard_max_lifetime".into(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

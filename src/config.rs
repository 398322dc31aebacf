//! Engine configuration.
//!
//! Every field has a default, so an empty YAML document is a valid config.
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Engine configuration loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decrypt into secure buffers when the session runs at L1.
    pub use_secure_buffers: bool,
    /// Decrypt directly to the output pipeline.
    pub use_fifo: bool,
    /// Decrypt into caller-owned memory.
    pub use_userspace_buffers: bool,
    /// Release requests address sessions by their literal id instead of the
    /// key set map.
    pub always_use_key_set_ids: bool,
    /// Lifetime of a release key set mapping, in seconds.
    pub release_session_ttl_secs: i64,
    /// Minimum interval between usage table refreshes, in seconds.
    pub usage_update_period_secs: i64,
    /// Canonical key system string.
    pub key_system: String,
    /// Reported by the `WidevineCdmVersion` status query.
    pub cdm_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_secure_buffers: false,
            use_fifo: false,
            use_userspace_buffers: true,
            always_use_key_set_ids: false,
            release_session_ttl_secs: 60,
            usage_update_period_secs: 60,
            key_system: "com.widevine.alpha".to_string(),
            cdm_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from a YAML string.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Load a config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    /// Whether `key_system` names this DRM scheme.
    pub fn is_valid_key_system(&self, key_system: &str) -> bool {
        key_system.contains("widevine")
    }
}

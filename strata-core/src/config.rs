//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::graph::DisposalPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub graph: GraphConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.tick_period_ms == 0 {
            return Err(ConfigError::InvalidTickPeriod);
        }
        Ok(())
    }
}

/// Settings for the dependency graph store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Policy given to keyed-cache nodes that are not pinned explicitly.
    pub family_policy: DisposalPolicy,
}

/// Settings for the study session timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_period_ms: u64,
}

impl SessionConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1000,
        }
    }
}

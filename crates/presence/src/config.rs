/// Presence settings
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{PresenceError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Master switch for the feature
    pub enabled: bool,
    /// Whether the current user may see who else is on a record
    pub can_view: bool,
    pub dirty_throttle_ms: u64,
    pub max_name_length: usize,
    pub max_listed_users: usize,
    /// Pause between WebSocket reconnect attempts
    pub reconnect_delay_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            can_view: true,
            dirty_throttle_ms: 500,
            max_name_length: 30,
            max_listed_users: 2,
            reconnect_delay_ms: 1000,
        }
    }
}

impl PresenceConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PresenceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dirty_throttle_ms == 0 {
            return Err(PresenceError::Config(
                "dirty_throttle_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_listed_users == 0 {
            return Err(PresenceError::Config(
                "max_listed_users must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Both switches must be on for the registry to do anything
    pub fn is_active(&self) -> bool {
        self.enabled && self.can_view
    }

    pub fn dirty_throttle(&self) -> Duration {
        Duration::milliseconds(self.dirty_throttle_ms as i64)
    }

    pub fn reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconnect_delay_ms)
    }
}

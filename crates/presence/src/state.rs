/// Per-user presence state inside a record group
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What one user is doing with a record, as reconciled from network events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_date: Option<DateTime<Utc>>,

    /// Highest record version this user is known to have saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty_date: Option<DateTime<Utc>>,

    /// Set when a user left after saving a version newer than ours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_date: Option<DateTime<Utc>>,
}

impl PresenceState {
    pub fn joined_at(at: DateTime<Utc>) -> Self {
        Self {
            join_date: Some(at),
            ..Default::default()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.unwrap_or(false)
    }

    pub fn has_left(&self) -> bool {
        self.left_date.is_some()
    }

    /// Known version, 0 when none was ever reported
    pub fn version_or_zero(&self) -> i64 {
        self.version.unwrap_or(0)
    }

    /// Record that this user saved `version` at `at`; a save clears dirtiness
    pub fn mark_saved(&mut self, version: i64, at: DateTime<Utc>) {
        self.version = Some(version);
        self.version_date = Some(at);
        self.dirty = Some(false);
        self.dirty_date = Some(at);
    }

    pub fn mark_dirty(&mut self, dirty: bool, at: DateTime<Utc>) {
        self.dirty = Some(dirty);
        self.dirty_date = Some(at);
    }

    /// Field-wise last-write-wins merge of a state message
    pub fn merge(&mut self, message: &StateMessage) {
        if let Some(version) = message.version {
            self.version = Some(version);
        }
        if let Some(at) = message.version_date {
            self.version_date = Some(at);
        }
        if let Some(dirty) = message.dirty {
            self.dirty = Some(dirty);
        }
        if let Some(at) = message.dirty_date {
            self.dirty_date = Some(at);
        }
    }
}

/// Payload of JOIN and STATE envelopes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty_date: Option<DateTime<Utc>>,
}

impl StateMessage {
    pub fn version(version: i64) -> Self {
        Self {
            version: Some(version),
            ..Default::default()
        }
    }

    pub fn dirty(dirty: bool) -> Self {
        Self {
            dirty: Some(dirty),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.version_date.is_none()
            && self.dirty.is_none()
            && self.dirty_date.is_none()
    }
}

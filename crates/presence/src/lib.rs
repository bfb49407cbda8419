/// Record presence: who else has a shared record open, who is editing it,
/// and whether someone already saved a newer version
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod binding;
pub use binding::*;

mod channel;
pub use channel::*;

mod client;
pub use client::*;

mod clock;
pub use clock::*;

mod color;
pub use color::*;

mod config;
pub use config::*;

mod protocol;
pub use protocol::*;

mod reconcile;
pub use reconcile::*;

mod registry;
pub use registry::*;

mod rejoin;
pub use rejoin::*;

pub mod relay;

mod state;
pub use state::*;

mod summary;
pub use summary::*;

mod throttle;
pub use throttle::*;

mod ws;
pub use ws::*;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("session {session} already joined {group}")]
    AlreadyJoined { group: GroupKey, session: SessionId },

    #[error("session {session} is not joined to {group}")]
    NotJoined { group: GroupKey, session: SessionId },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid group key: {0}")]
    InvalidGroupKey(String),
}

pub type Result<T> = std::result::Result<T, PresenceError>;

/// Identifies one local editor registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(model, record_id)` pair scoping all presence state of one record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub model: String,
    pub record_id: i64,
}

impl GroupKey {
    pub fn new(model: impl Into<String>, record_id: i64) -> Self {
        Self {
            model: model.into(),
            record_id,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.record_id)
    }
}

impl FromStr for GroupKey {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self> {
        // Model names may be dotted class names, the id is always last
        let (model, id) = s
            .rsplit_once(':')
            .ok_or_else(|| PresenceError::InvalidGroupKey(s.to_string()))?;
        if model.is_empty() {
            return Err(PresenceError::InvalidGroupKey(s.to_string()));
        }
        let record_id = id
            .parse::<i64>()
            .map_err(|_| PresenceError::InvalidGroupKey(s.to_string()))?;
        Ok(Self::new(model, record_id))
    }
}

/// A user as known to the presence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    /// Login code, the identity key for presence state
    pub code: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "$avatar", default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl User {
    pub fn new(id: i64, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Wire envelopes exchanged through the presence channel
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{GroupKey, PresenceError, PresenceState, Result, StateMessage, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "JOIN")]
    Join,

    #[serde(rename = "LEFT")]
    Left,

    #[serde(rename = "STATE")]
    State,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Join => "JOIN",
            Command::Left => "LEFT",
            Command::State => "STATE",
        };
        f.write_str(name)
    }
}

/// Body shared by JOIN and STATE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub model: String,

    #[serde(rename = "recordId")]
    pub record_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,

    /// Everyone currently in the group, sent by the relay as catch-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<User>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<StateMessage>,

    /// Relay-side state per user code, sent alongside `users`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<BTreeMap<String, PresenceState>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeftPayload {
    pub model: String,

    #[serde(rename = "recordId")]
    pub record_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

/// Presence message, discriminated on `command`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Envelope {
    #[serde(rename = "JOIN")]
    Join(RecordPayload),

    #[serde(rename = "LEFT")]
    Left(LeftPayload),

    #[serde(rename = "STATE")]
    State(RecordPayload),
}

impl Envelope {
    pub fn join(group: &GroupKey, user: Option<User>, message: Option<StateMessage>) -> Self {
        Envelope::Join(RecordPayload::new(group, user, message))
    }

    pub fn left(group: &GroupKey, user: Option<User>) -> Self {
        Envelope::Left(LeftPayload {
            model: group.model.clone(),
            record_id: group.record_id,
            user,
        })
    }

    pub fn state(group: &GroupKey, user: Option<User>, message: StateMessage) -> Self {
        Envelope::State(RecordPayload::new(group, user, Some(message)))
    }

    /// Parse an inbound frame. Anything that is not one of the three
    /// command shapes is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PresenceError::Protocol(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn command(&self) -> Command {
        match self {
            Envelope::Join(_) => Command::Join,
            Envelope::Left(_) => Command::Left,
            Envelope::State(_) => Command::State,
        }
    }

    pub fn group(&self) -> GroupKey {
        match self {
            Envelope::Join(p) | Envelope::State(p) => GroupKey::new(p.model.clone(), p.record_id),
            Envelope::Left(p) => GroupKey::new(p.model.clone(), p.record_id),
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Envelope::Join(p) | Envelope::State(p) => p.user.as_ref(),
            Envelope::Left(p) => p.user.as_ref(),
        }
    }

    pub fn set_user(&mut self, user: User) {
        match self {
            Envelope::Join(p) | Envelope::State(p) => p.user = Some(user),
            Envelope::Left(p) => p.user = Some(user),
        }
    }

    pub fn message(&self) -> Option<&StateMessage> {
        match self {
            Envelope::Join(p) | Envelope::State(p) => p.message.as_ref(),
            Envelope::Left(_) => None,
        }
    }

    pub fn users(&self) -> Option<&[User]> {
        match self {
            Envelope::Join(p) | Envelope::State(p) => p.users.as_deref(),
            Envelope::Left(_) => None,
        }
    }

    pub fn states(&self) -> Option<&BTreeMap<String, PresenceState>> {
        match self {
            Envelope::Join(p) | Envelope::State(p) => p.states.as_ref(),
            Envelope::Left(_) => None,
        }
    }
}

impl RecordPayload {
    pub fn new(group: &GroupKey, user: Option<User>, message: Option<StateMessage>) -> Self {
        Self {
            model: group.model.clone(),
            record_id: group.record_id,
            user,
            users: None,
            message: message.filter(|m| !m.is_empty()),
            states: None,
        }
    }

    pub fn with_snapshot(
        mut self,
        users: Vec<User>,
        states: BTreeMap<String, PresenceState>,
    ) -> Self {
        self.users = Some(users);
        self.states = Some(states);
        self
    }
}

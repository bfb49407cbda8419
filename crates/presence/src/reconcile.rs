/// Reconciliation of JOIN/LEFT/STATE events into per-group user state
///
/// Everything here is a plain state transition over `GroupUsers`: no I/O, no
/// clocks. The caller passes the record version it currently has loaded and
/// the timestamp to stamp onto new facts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{Envelope, PresenceState, StateMessage, User};

/// One user and what we know about them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user: User,
    pub state: PresenceState,
}

/// Users known in one record group, keyed by user code
#[derive(Debug, Clone, Default)]
pub struct GroupUsers {
    entries: BTreeMap<String, PresenceEntry>,
}

impl GroupUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&PresenceEntry> {
        self.entries.get(code)
    }

    /// Users ordered by join date, those without one first
    pub fn sorted(&self) -> Vec<&PresenceEntry> {
        let mut users: Vec<&PresenceEntry> = self.entries.values().collect();
        users.sort_by_key(|e| e.state.join_date);
        users
    }

    /// Apply one inbound envelope. Returns false when it was ignored.
    pub fn reconcile(
        &mut self,
        envelope: &Envelope,
        current_version: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(user) = envelope.user() else {
            debug!(
                "{} for {} received with no user, ignoring",
                envelope.command(),
                envelope.group()
            );
            return false;
        };

        if let Some(users) = envelope.users() {
            self.merge_users(users);
        }
        if let Some(states) = envelope.states() {
            self.merge_states(states);
        }

        match envelope {
            Envelope::Join(_) => self.apply_join(user, envelope.message(), current_version, now),
            Envelope::Left(_) => self.apply_left(user, current_version, now),
            Envelope::State(_) => {
                let message = envelope.message().cloned().unwrap_or_default();
                self.apply_state(user, &message, current_version, now)
            }
        }

        true
    }

    /// Bulk catch-up: make sure every listed identity has an entry
    pub fn merge_users(&mut self, users: &[User]) {
        for user in users {
            self.entries
                .entry(user.code.clone())
                .and_modify(|e| e.user = user.clone())
                .or_insert_with(|| PresenceEntry {
                    user: user.clone(),
                    state: PresenceState::default(),
                });
        }
    }

    /// Relay-side snapshot replaces the state of every user it mentions
    pub fn merge_states(&mut self, states: &BTreeMap<String, PresenceState>) {
        for (code, state) in states {
            if let Some(entry) = self.entries.get_mut(code) {
                entry.state = state.clone();
            }
        }
    }

    pub fn apply_join(
        &mut self,
        user: &User,
        message: Option<&StateMessage>,
        current_version: i64,
        now: DateTime<Utc>,
    ) {
        let entry = self
            .entries
            .entry(user.code.clone())
            .or_insert_with(|| PresenceEntry {
                user: user.clone(),
                state: PresenceState::default(),
            });

        // Welcome back
        entry.user = user.clone();
        entry.state.left_date = None;

        if let Some(message) = message {
            entry
                .state
                .merge(&normalize_message(message, current_version, now));
        }
        entry.state.join_date = Some(now);
    }

    pub fn apply_left(&mut self, user: &User, current_version: i64, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(&user.code) else {
            return;
        };

        // Someone who saved past us stays visible until we catch up
        if entry.state.version_or_zero() > current_version {
            entry.state.left_date = Some(now);
        } else {
            self.entries.remove(&user.code);
        }
    }

    pub fn apply_state(
        &mut self,
        user: &User,
        message: &StateMessage,
        current_version: i64,
        now: DateTime<Utc>,
    ) {
        let entry = self
            .entries
            .entry(user.code.clone())
            .or_insert_with(|| PresenceEntry {
                user: user.clone(),
                state: PresenceState::joined_at(now),
            });

        entry.user = user.clone();
        if entry.state.join_date.is_none() {
            entry.state.join_date = Some(now);
        }
        entry
            .state
            .merge(&normalize_message(message, current_version, now));
    }

    /// Drop users that left once our record caught up with what they saved.
    /// Returns true if anyone was removed.
    pub fn remove_left_users(&mut self, current_version: i64) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !e.state.has_left() || e.state.version_or_zero() > current_version);
        self.entries.len() != before
    }

    /// Mutate the entry of `code` if present
    pub fn update(&mut self, code: &str, f: impl FnOnce(&mut PresenceState)) -> bool {
        match self.entries.get_mut(code) {
            Some(entry) => {
                f(&mut entry.state);
                true
            }
            None => false,
        }
    }
}

/// Apply the STATE message rules: a bare version implies a clean record,
/// versions we already have are dropped, every reported field gets a date.
pub fn normalize_message(
    message: &StateMessage,
    current_version: i64,
    now: DateTime<Utc>,
) -> StateMessage {
    let mut msg = message.clone();

    if msg.version.is_some() && msg.dirty.is_none() {
        msg.dirty = Some(false);
    }

    if matches!(msg.version, Some(v) if v <= current_version) {
        msg.version = None;
        msg.version_date = None;
    }

    if msg.version.is_some() && msg.version_date.is_none() {
        msg.version_date = Some(now);
    }
    if msg.dirty.is_some() && msg.dirty_date.is_none() {
        msg.dirty_date = Some(now);
    }

    msg
}

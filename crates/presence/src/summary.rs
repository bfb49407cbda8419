/// Conflict detection and the display summary derived from group users
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ColorAssigner, PresenceEntry, PresenceState, User, UserColor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    #[default]
    None,
    Warning,
    Error,
}

/// Headline shown next to the record plus the optional conflict line
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub headline: String,
    pub conflict_line: Option<String>,
    pub conflict_severity: ConflictSeverity,
    pub tooltip: String,
}

impl Summary {
    pub fn has_conflict(&self) -> bool {
        self.conflict_severity != ConflictSeverity::None
    }
}

/// Naming and date formatting used when rendering summaries
pub trait Labels: Send + Sync {
    fn display_name(&self, user: &User) -> String;

    fn relative(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> String;

    /// Names of `users` as one line, truncated after a few entries
    fn names(&self, users: &[&User]) -> String;
}

/// English labels with name truncation
#[derive(Debug, Clone)]
pub struct PlainLabels {
    pub max_name_length: usize,
    pub max_listed_users: usize,
}

impl Default for PlainLabels {
    fn default() -> Self {
        Self {
            max_name_length: 30,
            max_listed_users: 2,
        }
    }
}

impl Labels for PlainLabels {
    fn display_name(&self, user: &User) -> String {
        let name = if user.name.is_empty() {
            if user.code.is_empty() {
                "?"
            } else {
                user.code.as_str()
            }
        } else {
            user.name.as_str()
        };

        if name.chars().count() > self.max_name_length {
            let cut: String = name.chars().take(self.max_name_length).collect();
            format!("{cut}…")
        } else {
            name.to_string()
        }
    }

    fn relative(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> String {
        let seconds = (now - at).num_seconds();
        let minutes = (seconds as f64 / 60.0).round() as i64;
        let hours = (seconds as f64 / 3600.0).round() as i64;
        let days = (seconds as f64 / 86400.0).round() as i64;

        match seconds {
            s if s < 45 => "just now".to_string(),
            s if s < 90 => "a minute ago".to_string(),
            s if s < 45 * 60 => format!("{} minutes ago", minutes.max(2)),
            s if s < 90 * 60 => "an hour ago".to_string(),
            s if s < 22 * 3600 => format!("{} hours ago", hours.max(2)),
            s if s < 36 * 3600 => "a day ago".to_string(),
            _ => format!("{} days ago", days.max(2)),
        }
    }

    fn names(&self, users: &[&User]) -> String {
        let listed: Vec<String> = users
            .iter()
            .take(self.max_listed_users)
            .map(|u| self.display_name(u))
            .collect();
        let text = listed.join(", ");
        if users.len() > self.max_listed_users {
            format!("{text}…")
        } else {
            text
        }
    }
}

/// Compute the summary for a group.
///
/// `users` must be in display order; the dirty tooltip is anchored to the
/// first dirty user in that order, not the one with the oldest dirty date.
pub fn compute_summary(
    users: &[&PresenceEntry],
    current_version: i64,
    me: &str,
    labels: &dyn Labels,
    now: DateTime<Utc>,
) -> Summary {
    let count = users.len();
    let headline = format!("{count} users");

    if let Some(saver) = save_user(users) {
        if saver.state.version_or_zero() > current_version && saver.user.code != me {
            return Summary {
                headline,
                conflict_line: Some(format!("Saved by {}", labels.names(&[&saver.user]))),
                conflict_severity: ConflictSeverity::Error,
                tooltip: format!(
                    "Saved {}",
                    relative_or_unknown(labels, saver.state.version_date, now)
                ),
            };
        }
    }

    let dirty: Vec<&PresenceEntry> = users
        .iter()
        .copied()
        .filter(|e| {
            e.state.is_dirty()
                && e.state.version.map_or(true, |v| v <= current_version)
                && e.user.code != me
        })
        .collect();

    if let Some(first) = dirty.first() {
        let names: Vec<&User> = dirty.iter().map(|e| &e.user).collect();
        return Summary {
            headline,
            conflict_line: Some(format!("Editing: {}", labels.names(&names))),
            conflict_severity: ConflictSeverity::Warning,
            tooltip: format!(
                "Editing since {}",
                relative_or_unknown(labels, first.state.dirty_date, now)
            ),
        };
    }

    Summary {
        headline,
        conflict_line: None,
        conflict_severity: ConflictSeverity::None,
        tooltip: format!("{count} users on this record"),
    }
}

/// The user with the highest known version, ties going to the latest save
pub fn save_user<'a>(users: &[&'a PresenceEntry]) -> Option<&'a PresenceEntry> {
    users.iter().copied().reduce(|a, b| {
        let (va, vb) = (a.state.version_or_zero(), b.state.version_or_zero());
        if va > vb {
            return a;
        }
        if va < vb {
            return b;
        }
        match (a.state.version_date, b.state.version_date) {
            (Some(da), Some(db)) if da < db => b,
            (None, Some(_)) => b,
            _ => a,
        }
    })
}

fn relative_or_unknown(labels: &dyn Labels, at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at {
        Some(at) => labels.relative(at, now),
        None => "recently".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Joined,
    Dirty,
    Saved,
    Left,
}

impl UserStatus {
    pub fn of(state: &PresenceState, current_version: i64) -> Self {
        if state.has_left() {
            UserStatus::Left
        } else if state.version_or_zero() > current_version && state.version_date.is_some() {
            UserStatus::Saved
        } else if state.is_dirty() {
            UserStatus::Dirty
        } else {
            UserStatus::Joined
        }
    }
}

/// One row of the user list handed to the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub user: User,
    pub state: PresenceState,
    pub status: UserStatus,
    pub color: UserColor,
    pub status_line: String,
}

impl UserView {
    pub fn build(
        entry: &PresenceEntry,
        current_version: i64,
        colors: &mut ColorAssigner,
        labels: &dyn Labels,
        now: DateTime<Utc>,
    ) -> Self {
        let status = UserStatus::of(&entry.state, current_version);
        let name = labels.display_name(&entry.user);
        let state = &entry.state;
        let status_line = match status {
            UserStatus::Left => format!(
                "{name} left {}",
                relative_or_unknown(labels, state.left_date, now)
            ),
            UserStatus::Saved => format!(
                "{name} saved {}",
                relative_or_unknown(labels, state.version_date, now)
            ),
            UserStatus::Dirty => format!(
                "{name} is editing since {}",
                relative_or_unknown(labels, state.dirty_date, now)
            ),
            UserStatus::Joined => format!(
                "{name} joined {}",
                relative_or_unknown(labels, state.join_date, now)
            ),
        };

        Self {
            user: entry.user.clone(),
            state: entry.state.clone(),
            status,
            color: colors.color_for(&entry.user.code),
            status_line,
        }
    }
}

/// Everything a session shows about its record group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceView {
    pub users: Vec<UserView>,
    pub summary: Summary,
}

impl PresenceView {
    /// Presence is only worth showing when someone besides us is there
    pub fn is_visible(&self) -> bool {
        self.users.len() > 1
    }
}

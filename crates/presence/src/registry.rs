//! The presence registry.
//!
//! One registry per client process. Editor sessions join the record group
//! they display, report local version and dirty changes, and get a
//! [`PresenceView`] pushed to them through a watch channel whenever the group
//! changes. Inbound envelopes and reconnect notifications are fed in by the
//! owner of the registry (see [`crate::PresenceClient`]).
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    compute_summary, ChannelEvent, Clock, ColorAssigner, Envelope, GroupKey, GroupUsers, Labels,
    PlainLabels, PresenceChannel, PresenceConfig, PresenceEntry, PresenceError, PresenceView,
    RejoinManager, SessionId, StateMessage, Throttle, User, UserView,
};

struct SessionSlot {
    id: SessionId,
    /// Record version the session has loaded; `None` until the first report
    version: Option<i64>,
    view: watch::Sender<PresenceView>,
}

struct GroupEntry {
    sessions: Vec<SessionSlot>,
    users: GroupUsers,
    /// Dirty flag last announced for this group, shared by all its sessions
    last_dirty: bool,
    throttle: Throttle<bool>,
}

impl GroupEntry {
    fn new(window: chrono::Duration) -> Self {
        Self {
            sessions: Vec::new(),
            users: GroupUsers::new(),
            last_dirty: false,
            throttle: Throttle::new(window),
        }
    }

    fn has_baseline(&self) -> bool {
        self.sessions.iter().any(|s| s.version.is_some())
    }

    /// Highest version any local session has loaded
    fn current_version(&self) -> i64 {
        self.sessions
            .iter()
            .filter_map(|s| s.version)
            .max()
            .unwrap_or(0)
    }

    fn slot_mut(&mut self, session: SessionId) -> Option<&mut SessionSlot> {
        self.sessions.iter_mut().find(|s| s.id == session)
    }
}

pub struct PresenceRegistry<C: PresenceChannel> {
    me: User,
    channel: C,
    config: PresenceConfig,
    clock: Arc<dyn Clock>,
    labels: Box<dyn Labels>,
    colors: ColorAssigner,
    rejoins: RejoinManager,
    groups: BTreeMap<GroupKey, GroupEntry>,
}

impl<C: PresenceChannel> PresenceRegistry<C> {
    pub fn new(me: User, channel: C, config: PresenceConfig, clock: Arc<dyn Clock>) -> Self {
        let labels = PlainLabels {
            max_name_length: config.max_name_length,
            max_listed_users: config.max_listed_users,
        };
        Self {
            me,
            channel,
            config,
            clock,
            labels: Box::new(labels),
            colors: ColorAssigner::new(),
            rejoins: RejoinManager::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl Labels + 'static) -> Self {
        self.labels = Box::new(labels);
        self
    }

    pub fn me(&self) -> &User {
        &self.me
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn groups(&self) -> Vec<GroupKey> {
        self.groups.keys().cloned().collect()
    }

    pub fn is_joined(&self, group: &GroupKey, session: SessionId) -> bool {
        self.groups
            .get(group)
            .is_some_and(|e| e.sessions.iter().any(|s| s.id == session))
    }

    pub fn session_count(&self, group: &GroupKey) -> usize {
        self.groups.get(group).map_or(0, |e| e.sessions.len())
    }

    /// Known users of a group in display order
    pub fn users(&self, group: &GroupKey) -> Vec<PresenceEntry> {
        self.groups
            .get(group)
            .map(|e| e.users.sorted().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn join(
        &mut self,
        group: GroupKey,
        session: SessionId,
        initial: Option<StateMessage>,
    ) -> Option<watch::Receiver<PresenceView>> {
        if !self.config.is_active() {
            debug!("Presence disabled, not joining {}", group);
            return None;
        }

        let window = self.config.dirty_throttle();
        let entry = self
            .groups
            .entry(group.clone())
            .or_insert_with(|| GroupEntry::new(window));
        if entry.sessions.iter().any(|s| s.id == session) {
            error!("{}", PresenceError::AlreadyJoined { group, session });
            return None;
        }

        let (tx, rx) = watch::channel(PresenceView::default());
        entry.sessions.push(SessionSlot {
            id: session,
            version: None,
            view: tx,
        });
        if let Some(dirty) = initial.as_ref().and_then(|m| m.dirty) {
            entry.last_dirty = dirty;
        }

        let join = Envelope::join(&group, Some(self.me.clone()), initial);
        self.rejoins.register(group.clone(), join.clone());
        dispatch(&self.channel, join);
        info!("Session {} joined {}", session, group);

        Some(rx)
    }

    /// Returns false when the session was not in the group
    pub fn leave(&mut self, group: &GroupKey, session: SessionId) -> bool {
        let Some(entry) = self.groups.get_mut(group) else {
            return false;
        };
        let Some(pos) = entry.sessions.iter().position(|s| s.id == session) else {
            return false;
        };

        self.rejoins.remove(group);
        entry.sessions.remove(pos);
        let empty = entry.sessions.is_empty();

        dispatch(&self.channel, Envelope::left(group, Some(self.me.clone())));
        info!("Session {} left {}", session, group);

        if empty {
            debug!("No sessions left on {}, dropping it", group);
            self.groups.remove(group);
        } else {
            self.publish(group);
        }
        true
    }

    pub fn on_version_changed(&mut self, group: &GroupKey, session: SessionId, version: i64) {
        let now = self.clock.now();
        let Some(entry) = self.groups.get_mut(group) else {
            debug!("{}", PresenceError::NotJoined { group: group.clone(), session });
            return;
        };
        let Some(slot) = entry.slot_mut(session) else {
            debug!("{}", PresenceError::NotJoined { group: group.clone(), session });
            return;
        };

        match slot.version {
            None => {
                debug!("Session {} loaded {} at version {}", session, group, version);
                slot.version = Some(version);
            }
            Some(previous) if previous == version => return,
            Some(_) => {
                slot.version = Some(version);
                entry.last_dirty = false;
                entry.throttle.cancel();

                dispatch(
                    &self.channel,
                    Envelope::state(group, Some(self.me.clone()), StateMessage::version(version)),
                );
                entry
                    .users
                    .update(&self.me.code, |s| s.mark_saved(version, now));
            }
        }

        let current = entry.current_version();
        entry.users.remove_left_users(current);
        self.publish(group);
    }

    pub fn on_dirty_changed(&mut self, group: &GroupKey, session: SessionId, dirty: bool) {
        let now = self.clock.now();
        let Some(entry) = self
            .groups
            .get_mut(group)
            .filter(|e| e.sessions.iter().any(|s| s.id == session))
        else {
            debug!("{}", PresenceError::NotJoined { group: group.clone(), session });
            return;
        };

        if let Some(dirty) = entry.throttle.offer(dirty, now) {
            self.broadcast_dirty(group, dirty, now);
        }
    }

    /// The session's record was reset from outside (reloaded, discarded)
    pub fn on_external_reset(&mut self, group: &GroupKey, session: SessionId) {
        let now = self.clock.now();
        let Some(entry) = self.groups.get_mut(group) else {
            return;
        };
        let Some(slot) = entry.slot_mut(session) else {
            return;
        };

        slot.version = None;
        entry.throttle.cancel();
        if entry.last_dirty {
            entry.last_dirty = false;
            dispatch(
                &self.channel,
                Envelope::state(group, Some(self.me.clone()), StateMessage::dirty(false)),
            );
            entry
                .users
                .update(&self.me.code, |s| s.mark_dirty(false, now));
        }

        let current = entry.current_version();
        entry.users.remove_left_users(current);
        self.publish(group);
    }

    /// Fold one inbound envelope into its group. Returns false when it was ignored.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> bool {
        if envelope.user().is_none() {
            debug!("{} without user, ignoring", envelope.command());
            return false;
        }

        let group = envelope.group();
        let Some(entry) = self.groups.get_mut(&group) else {
            debug!("{} for {} which is not joined, ignoring", envelope.command(), group);
            return false;
        };

        let current = entry.current_version();
        if !entry.users.reconcile(envelope, current, self.clock.now()) {
            return false;
        }
        self.publish(&group);
        true
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(envelope) => {
                self.handle_envelope(&envelope);
            }
            ChannelEvent::Connected => {
                self.on_reconnect();
            }
        }
    }

    /// Replay the JOIN of every active group. Returns how many were sent.
    pub fn on_reconnect(&mut self) -> usize {
        if !self.config.is_active() {
            return 0;
        }
        let sent = self.rejoins.replay(&self.channel);
        if sent > 0 {
            info!("Rejoined {} groups", sent);
        }
        sent
    }

    /// Fire throttled dirty values that are due. Returns how many were broadcast.
    pub fn flush_throttled(&mut self) -> usize {
        let now = self.clock.now();
        let due: Vec<(GroupKey, bool)> = self
            .groups
            .iter_mut()
            .filter_map(|(group, entry)| {
                entry
                    .throttle
                    .take_due(now)
                    .map(|dirty| (group.clone(), dirty))
            })
            .collect();

        let mut sent = 0;
        for (group, dirty) in due {
            if self.broadcast_dirty(&group, dirty, now) {
                sent += 1;
            }
        }
        sent
    }

    /// Earliest moment a throttled value becomes due
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.groups
            .values()
            .filter_map(|e| e.throttle.deadline())
            .min()
    }

    pub fn view(&self, group: &GroupKey, session: SessionId) -> PresenceView {
        if !self.config.is_active() {
            return PresenceView::default();
        }
        self.groups
            .get(group)
            .and_then(|e| e.sessions.iter().find(|s| s.id == session))
            .map(|s| s.view.borrow().clone())
            .unwrap_or_default()
    }

    fn broadcast_dirty(&mut self, group: &GroupKey, dirty: bool, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.groups.get_mut(group) else {
            return false;
        };
        if !entry.has_baseline() || entry.last_dirty == dirty {
            return false;
        }
        entry.last_dirty = dirty;

        dispatch(
            &self.channel,
            Envelope::state(group, Some(self.me.clone()), StateMessage::dirty(dirty)),
        );
        entry.users.update(&self.me.code, |s| s.mark_dirty(dirty, now));
        self.publish(group);
        true
    }

    /// Recompute and push the view of every session in the group
    fn publish(&mut self, group: &GroupKey) {
        let now = self.clock.now();
        let Some(entry) = self.groups.get(group) else {
            return;
        };

        let group_version = entry.current_version();
        let sorted = entry.users.sorted();
        for slot in &entry.sessions {
            let current = slot.version.unwrap_or(group_version);
            let users = sorted
                .iter()
                .map(|e| UserView::build(e, current, &mut self.colors, self.labels.as_ref(), now))
                .collect();
            let summary =
                compute_summary(&sorted, current, &self.me.code, self.labels.as_ref(), now);
            slot.view.send_replace(PresenceView { users, summary });
        }
    }
}

fn dispatch<C: PresenceChannel>(channel: &C, envelope: Envelope) {
    let command = envelope.command();
    let group = envelope.group();
    if let Err(e) = channel.send(envelope) {
        warn!("Failed to send {} for {}: {}", command, group, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, ConflictSeverity, ManualClock, PresenceState, RecordingChannel};
    use chrono::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        channel: Arc<RecordingChannel>,
        registry: PresenceRegistry<Arc<RecordingChannel>>,
    }

    fn fixture(config: PresenceConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let channel = Arc::new(RecordingChannel::new());
        let registry = PresenceRegistry::new(
            User::new(1, "me", "Me"),
            channel.clone(),
            config,
            clock.clone(),
        );
        Fixture {
            clock,
            channel,
            registry,
        }
    }

    fn group() -> GroupKey {
        GroupKey::new("Invoice", 42)
    }

    fn bob() -> User {
        User::new(2, "bob", "Bob")
    }

    #[test]
    fn test_join_sends_join_and_registers_rejoin() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();

        let rx = f.registry.join(group(), session, Some(StateMessage::dirty(true)));
        assert!(rx.is_some());

        let sent = f.channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command(), Command::Join);
        assert_eq!(sent[0].user().unwrap().code, "me");
        assert_eq!(sent[0].message().unwrap().dirty, Some(true));

        assert_eq!(f.registry.on_reconnect(), 1);
        assert_eq!(f.channel.take(), sent);
    }

    #[test]
    fn test_duplicate_join_is_ignored() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();

        assert!(f.registry.join(group(), session, None).is_some());
        assert!(f.registry.join(group(), session, None).is_none());
        assert_eq!(f.registry.session_count(&group()), 1);
        assert_eq!(f.channel.sent().len(), 1);
    }

    #[test]
    fn test_disabled_registry_does_nothing() {
        let config = PresenceConfig {
            can_view: false,
            ..PresenceConfig::default()
        };
        let mut f = fixture(config);
        let session = SessionId::new();

        assert!(f.registry.join(group(), session, None).is_none());
        assert!(f.channel.sent().is_empty());
        assert_eq!(f.registry.on_reconnect(), 0);
        assert_eq!(f.registry.view(&group(), session), PresenceView::default());
    }

    #[test]
    fn test_leave_sends_left_and_drops_group() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.channel.take();

        assert!(f.registry.leave(&group(), session));
        assert!(!f.registry.leave(&group(), session));

        let sent = f.channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command(), Command::Left);
        assert!(f.registry.groups().is_empty());
        assert_eq!(f.registry.on_reconnect(), 0);
    }

    #[test]
    fn test_first_version_is_baseline() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.channel.take();

        f.registry.on_version_changed(&group(), session, 1);
        assert!(f.channel.sent().is_empty());

        f.registry.on_version_changed(&group(), session, 1);
        assert!(f.channel.sent().is_empty());

        f.registry.on_version_changed(&group(), session, 2);
        let sent = f.channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message().unwrap().version, Some(2));
    }

    #[test]
    fn test_dirty_needs_baseline_and_change() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.channel.take();

        f.registry.on_dirty_changed(&group(), session, true);
        assert!(f.channel.sent().is_empty());

        f.registry.on_version_changed(&group(), session, 1);
        f.clock.advance(Duration::seconds(1));
        f.registry.on_dirty_changed(&group(), session, true);
        let sent = f.channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message().unwrap().dirty, Some(true));

        f.clock.advance(Duration::seconds(1));
        f.registry.on_dirty_changed(&group(), session, true);
        assert!(f.channel.sent().is_empty());
    }

    #[test]
    fn test_throttled_dirty_fires_trailing_value() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.registry.on_version_changed(&group(), session, 1);
        f.channel.take();

        f.registry.on_dirty_changed(&group(), session, true);
        f.clock.advance(Duration::milliseconds(100));
        f.registry.on_dirty_changed(&group(), session, false);
        assert_eq!(f.channel.take().len(), 1);

        let deadline = f.registry.next_deadline().unwrap();
        assert_eq!(f.registry.flush_throttled(), 0);

        f.clock.set(deadline);
        assert_eq!(f.registry.flush_throttled(), 1);
        let sent = f.channel.take();
        assert_eq!(sent[0].message().unwrap().dirty, Some(false));
        assert!(f.registry.next_deadline().is_none());
    }

    #[test]
    fn test_save_cancels_pending_dirty() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.registry.on_version_changed(&group(), session, 1);
        f.registry.on_dirty_changed(&group(), session, true);
        f.registry.on_dirty_changed(&group(), session, false);
        f.registry.on_dirty_changed(&group(), session, true);
        f.channel.take();

        f.registry.on_version_changed(&group(), session, 2);
        assert!(f.registry.next_deadline().is_none());
        assert_eq!(f.channel.take().len(), 1);
    }

    #[test]
    fn test_external_reset_clears_dirty_once() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        f.registry.join(group(), session, None);
        f.registry.on_version_changed(&group(), session, 1);
        f.registry.on_dirty_changed(&group(), session, true);
        f.channel.take();

        f.registry.on_external_reset(&group(), session);
        let sent = f.channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message().unwrap().dirty, Some(false));

        f.registry.on_external_reset(&group(), session);
        assert!(f.channel.sent().is_empty());

        // Baseline is gone, so the next version is silent again
        f.registry.on_version_changed(&group(), session, 5);
        assert!(f.channel.sent().is_empty());
    }

    #[test]
    fn test_dirty_throttle_is_shared_by_sessions_of_a_group() {
        let mut f = fixture(PresenceConfig::default());
        let first = SessionId::new();
        let second = SessionId::new();
        f.registry.join(group(), first, None);
        f.registry.join(group(), second, None);
        f.registry.on_version_changed(&group(), first, 1);
        f.registry.on_version_changed(&group(), second, 1);
        f.channel.take();

        for i in 0..10 {
            let session = if i % 2 == 0 { first } else { second };
            f.registry.on_dirty_changed(&group(), session, i % 2 == 0);
            f.clock.advance(Duration::milliseconds(45));
        }

        let states = f
            .channel
            .take()
            .into_iter()
            .filter(|e| e.command() == Command::State)
            .count();
        assert_eq!(states, 1);

        // One trailing value for the whole group
        f.clock.set(f.registry.next_deadline().unwrap());
        assert_eq!(f.registry.flush_throttled(), 1);
        assert_eq!(f.channel.take()[0].message().unwrap().dirty, Some(false));
    }

    #[test]
    fn test_reload_to_newer_version_drops_left_user() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        let mut rx = f.registry.join(group(), session, None).unwrap();
        f.registry.on_version_changed(&group(), session, 1);

        f.registry
            .handle_envelope(&Envelope::join(&group(), Some(bob()), None));
        f.registry.handle_envelope(&Envelope::state(
            &group(),
            Some(bob()),
            StateMessage::version(2),
        ));
        f.registry
            .handle_envelope(&Envelope::left(&group(), Some(bob())));
        assert!(f.registry.users(&group()).iter().any(|e| e.user.code == "bob"));

        f.registry.on_external_reset(&group(), session);
        assert!(f.registry.users(&group()).iter().any(|e| e.user.code == "bob"));

        f.registry.on_version_changed(&group(), session, 2);
        assert!(f.registry.users(&group()).iter().all(|e| e.user.code != "bob"));
        let view = rx.borrow_and_update().clone();
        assert!(view.users.iter().all(|u| u.user.code != "bob"));
    }

    #[test]
    fn test_leave_drops_rejoin_even_with_sessions_left() {
        let mut f = fixture(PresenceConfig::default());
        let first = SessionId::new();
        let second = SessionId::new();
        f.registry.join(group(), first, None);
        f.registry.join(group(), second, None);
        assert_eq!(f.registry.on_reconnect(), 1);

        assert!(f.registry.leave(&group(), first));
        assert!(f.registry.is_joined(&group(), second));
        assert_eq!(f.registry.on_reconnect(), 0);

        // Joining again re-arms the replay
        f.registry.join(group(), first, None);
        assert_eq!(f.registry.on_reconnect(), 1);
    }

    #[test]
    fn test_inbound_state_updates_view() {
        let mut f = fixture(PresenceConfig::default());
        let session = SessionId::new();
        let mut rx = f.registry.join(group(), session, None).unwrap();
        f.registry.on_version_changed(&group(), session, 1);

        let mut me_state = BTreeMap::new();
        me_state.insert("me".to_string(), PresenceState::joined_at(f.clock.now()));
        let welcome = Envelope::Join(
            crate::RecordPayload::new(&group(), Some(f.registry.me().clone()), None)
                .with_snapshot(vec![f.registry.me().clone()], me_state),
        );
        assert!(f.registry.handle_envelope(&welcome));
        assert!(!rx.borrow_and_update().is_visible());

        f.clock.advance(Duration::seconds(5));
        f.registry
            .handle_envelope(&Envelope::join(&group(), Some(bob()), None));
        f.registry.handle_envelope(&Envelope::state(
            &group(),
            Some(bob()),
            StateMessage::dirty(true),
        ));

        let view = rx.borrow_and_update().clone();
        assert!(view.is_visible());
        assert_eq!(view.users.len(), 2);
        assert_eq!(view.users[0].user.code, "me");
        assert_eq!(view.summary.conflict_severity, ConflictSeverity::Warning);
        assert_eq!(view.summary.conflict_line.as_deref(), Some("Editing: Bob"));
    }

    #[test]
    fn test_envelopes_for_unknown_groups_are_ignored() {
        let mut f = fixture(PresenceConfig::default());
        let other = GroupKey::new("Order", 1);
        assert!(!f
            .registry
            .handle_envelope(&Envelope::join(&other, Some(bob()), None)));

        f.registry.join(group(), SessionId::new(), None);
        assert!(!f.registry.handle_envelope(&Envelope::join(&group(), None, None)));
        assert!(f.registry.users(&group()).is_empty());
    }

    #[test]
    fn test_send_failure_is_not_fatal() {
        let mut f = fixture(PresenceConfig::default());
        f.channel.set_failing(true);
        let session = SessionId::new();
        assert!(f.registry.join(group(), session, None).is_some());
        assert!(f.registry.is_joined(&group(), session));
    }
}

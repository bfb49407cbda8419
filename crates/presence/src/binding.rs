/// Glue between one editor session and the registry
use tokio::sync::watch;
use tracing::debug;

use crate::{GroupKey, PresenceChannel, PresenceRegistry, PresenceView, SessionId, StateMessage};

/// What an editor currently displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditorSnapshot {
    /// Unsaved records have no id (or a non-positive one) and never join
    pub record_id: Option<i64>,
    pub version: Option<i64>,
    pub dirty: bool,
}

impl EditorSnapshot {
    pub fn record(record_id: i64, version: i64) -> Self {
        Self {
            record_id: Some(record_id),
            version: Some(version),
            dirty: false,
        }
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }
}

/// Tracks the last snapshot of one editor and turns changes into registry calls
pub struct SessionBinding {
    session: SessionId,
    model: String,
    group: Option<GroupKey>,
    last: EditorSnapshot,
    view: Option<watch::Receiver<PresenceView>>,
}

impl SessionBinding {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            session: SessionId::new(),
            model: model.into(),
            group: None,
            last: EditorSnapshot::default(),
            view: None,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn group(&self) -> Option<&GroupKey> {
        self.group.as_ref()
    }

    /// Feed the editor's current state. Record switches are handled first,
    /// then version, then dirty.
    pub fn update<C: PresenceChannel>(
        &mut self,
        registry: &mut PresenceRegistry<C>,
        snapshot: EditorSnapshot,
    ) {
        if snapshot.record_id != self.last.record_id {
            self.teardown(registry);
            if let Some(id) = snapshot.record_id.filter(|id| *id > 0) {
                let group = GroupKey::new(self.model.clone(), id);
                let initial = snapshot.dirty.then(|| StateMessage::dirty(true));
                self.view = registry.join(group.clone(), self.session, initial);
                self.group = Some(group);
            }
            self.last = EditorSnapshot {
                record_id: snapshot.record_id,
                version: None,
                dirty: snapshot.dirty,
            };
        }

        let Some(group) = self.group.clone() else {
            self.last = snapshot;
            return;
        };

        if let Some(version) = snapshot.version {
            if self.last.version != Some(version) {
                registry.on_version_changed(&group, self.session, version);
            }
        }

        if snapshot.dirty != self.last.dirty {
            registry.on_dirty_changed(&group, self.session, snapshot.dirty);
        }

        self.last = snapshot;
    }

    /// The record was reloaded or its changes discarded outside the editor
    pub fn reset<C: PresenceChannel>(&mut self, registry: &mut PresenceRegistry<C>) {
        if let Some(group) = &self.group {
            registry.on_external_reset(group, self.session);
        }
        self.last.version = None;
        self.last.dirty = false;
    }

    /// Latest published view, empty when not joined or presence is off
    pub fn view(&self) -> PresenceView {
        self.view
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }

    /// A receiver that is notified on every republish
    pub fn subscribe(&self) -> Option<watch::Receiver<PresenceView>> {
        self.view.clone()
    }

    /// Leave the current group, if any
    pub fn teardown<C: PresenceChannel>(&mut self, registry: &mut PresenceRegistry<C>) {
        if let Some(group) = self.group.take() {
            debug!("Session {} leaving {}", self.session, group);
            registry.leave(&group, self.session);
        }
        self.view = None;
        self.last = EditorSnapshot::default();
    }
}

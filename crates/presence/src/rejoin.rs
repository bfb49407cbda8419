/// Replay of JOIN messages after the transport reconnects
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::{Envelope, GroupKey, PresenceChannel};

/// One replayable JOIN per active group.
///
/// Registering a group again overwrites its previous JOIN, so when several
/// local sessions watch the same group only the most recently joined one is
/// replayed. Later STATE messages fill in the rest.
#[derive(Debug, Clone, Default)]
pub struct RejoinManager {
    actions: BTreeMap<GroupKey, Envelope>,
}

impl RejoinManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, group: GroupKey, join: Envelope) {
        self.actions.insert(group, join);
    }

    pub fn remove(&mut self, group: &GroupKey) -> Option<Envelope> {
        self.actions.remove(group)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Re-send every registered JOIN. Returns how many were handed to the channel.
    pub fn replay<C: PresenceChannel + ?Sized>(&self, channel: &C) -> usize {
        let mut sent = 0;
        for (group, join) in &self.actions {
            match channel.send(join.clone()) {
                Ok(()) => {
                    debug!("Rejoined {}", group);
                    sent += 1;
                }
                Err(e) => warn!("Failed to rejoin {}: {}", group, e),
            }
        }
        sent
    }
}

//! Relay-side room bookkeeping.
//!
//! The relay is the fan-out point between clients: it remembers which
//! connections sit in which record group, keeps a small per-user state so
//! late joiners can catch up, and decides who receives each envelope. It does
//! no I/O; callers deliver the returned [`Delivery`] list themselves.
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::{Envelope, GroupKey, PresenceState, RecordPayload, StateMessage, User};

pub type ConnectionId = u64;

/// An envelope addressed to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub envelope: Envelope,
}

#[derive(Debug, Default)]
struct Room {
    members: Vec<(ConnectionId, User)>,
    states: BTreeMap<String, PresenceState>,
}

impl Room {
    fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = Vec::new();
        for (_, user) in &self.members {
            if !users.iter().any(|u| u.code == user.code) {
                users.push(user.clone());
            }
        }
        users
    }

    fn apply(&mut self, code: &str, message: &StateMessage, now: DateTime<Utc>) {
        let state = self
            .states
            .entry(code.to_string())
            .or_insert_with(|| PresenceState::joined_at(now));

        if let Some(dirty) = message.dirty {
            state.mark_dirty(dirty, now);
        }
        if let Some(version) = message.version {
            state.mark_saved(version, now);
        }
    }
}

/// All rooms of one relay process
#[derive(Debug, Default)]
pub struct RelayRooms {
    rooms: HashMap<GroupKey, Room>,
    hidden: Vec<ConnectionId>,
}

impl RelayRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections that may not see presence still take part, but receive nothing
    pub fn set_can_view(&mut self, conn: ConnectionId, can_view: bool) {
        self.hidden.retain(|c| *c != conn);
        if !can_view {
            self.hidden.push(conn);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, group: &GroupKey) -> Vec<ConnectionId> {
        self.rooms
            .get(group)
            .map(|r| r.members.iter().map(|(c, _)| *c).collect())
            .unwrap_or_default()
    }

    pub fn state_of(&self, group: &GroupKey, code: &str) -> Option<&PresenceState> {
        self.rooms.get(group).and_then(|r| r.states.get(code))
    }

    /// Route one envelope sent by `from`, acting as `user`
    pub fn handle(
        &mut self,
        from: ConnectionId,
        user: User,
        mut envelope: Envelope,
        now: DateTime<Utc>,
    ) -> Vec<Delivery> {
        let group = envelope.group();
        envelope.set_user(user.clone());

        match &envelope {
            Envelope::Join(payload) => {
                let mut deliveries = Vec::new();
                let room = self.rooms.entry(group.clone()).or_default();
                if !room.members.iter().any(|(c, _)| *c == from) {
                    room.members.push((from, user.clone()));
                }
                room.states
                    .entry(user.code.clone())
                    .or_insert_with(|| PresenceState::joined_at(now));

                let welcome = RecordPayload::new(&group, Some(user.clone()), payload.message.clone())
                    .with_snapshot(room.users(), room.states.clone());

                if let Some(message) = &payload.message {
                    room.apply(&user.code, message, now);
                }

                info!("{} joined {}", user.code, group);
                if self.can_view(from) {
                    deliveries.push(Delivery {
                        to: from,
                        envelope: Envelope::Join(welcome),
                    });
                }
                deliveries.extend(self.broadcast(&group, from, &envelope));
                deliveries
            }
            Envelope::State(payload) => {
                if let (Some(room), Some(message)) = (self.rooms.get_mut(&group), &payload.message) {
                    room.apply(&user.code, message, now);
                }
                self.broadcast(&group, from, &envelope)
            }
            Envelope::Left(_) => self.remove(from, &user, &group),
        }
    }

    /// Drop a connection from every room it was in
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<Delivery> {
        let joined: Vec<(GroupKey, User)> = self
            .rooms
            .iter()
            .filter_map(|(group, room)| {
                room.members
                    .iter()
                    .find(|(c, _)| *c == conn)
                    .map(|(_, user)| (group.clone(), user.clone()))
            })
            .collect();

        let mut deliveries = Vec::new();
        for (group, user) in joined {
            deliveries.extend(self.remove(conn, &user, &group));
        }
        self.hidden.retain(|c| *c != conn);
        deliveries
    }

    fn remove(&mut self, conn: ConnectionId, user: &User, group: &GroupKey) -> Vec<Delivery> {
        let Some(room) = self.rooms.get_mut(group) else {
            return Vec::new();
        };

        let before = room.members.len();
        room.members.retain(|(c, _)| *c != conn);
        let removed = room.members.len() != before;
        room.states.remove(&user.code);

        if room.members.is_empty() {
            debug!("Room {} is empty, removing", group);
            self.rooms.remove(group);
        }

        if !removed {
            return Vec::new();
        }

        info!("{} left {}", user.code, group);
        let left = Envelope::left(group, Some(user.clone()));
        self.broadcast(group, conn, &left)
    }

    fn broadcast(&self, group: &GroupKey, from: ConnectionId, envelope: &Envelope) -> Vec<Delivery> {
        let Some(room) = self.rooms.get(group) else {
            return Vec::new();
        };

        room.members
            .iter()
            .filter(|(c, _)| *c != from && self.can_view(*c))
            .map(|(c, _)| Delivery {
                to: *c,
                envelope: envelope.clone(),
            })
            .collect()
    }

    fn can_view(&self, conn: ConnectionId) -> bool {
        !self.hidden.contains(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    fn alice() -> User {
        User::new(1, "alice", "Alice")
    }

    fn bob() -> User {
        User::new(2, "bob", "Bob")
    }

    fn group() -> GroupKey {
        GroupKey::new("Invoice", 42)
    }

    #[test]
    fn test_join_welcomes_joiner_and_notifies_others() {
        let mut rooms = RelayRooms::new();
        let now = Utc::now();

        let first = rooms.handle(1, alice(), Envelope::join(&group(), None, None), now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].to, 1);

        let second = rooms.handle(2, bob(), Envelope::join(&group(), None, None), now);
        assert_eq!(second.len(), 2);

        let welcome = &second[0];
        assert_eq!(welcome.to, 2);
        assert_eq!(welcome.envelope.command(), Command::Join);
        assert_eq!(welcome.envelope.user().unwrap().code, "bob");
        let codes: Vec<_> = welcome
            .envelope
            .users()
            .unwrap()
            .iter()
            .map(|u| u.code.as_str())
            .collect();
        assert_eq!(codes, vec!["alice", "bob"]);
        assert!(welcome.envelope.states().unwrap().contains_key("alice"));

        let notice = &second[1];
        assert_eq!(notice.to, 1);
        assert_eq!(notice.envelope.user().unwrap().code, "bob");
        assert!(notice.envelope.users().is_none());
    }

    #[test]
    fn test_state_updates_relay_state_and_fans_out() {
        let mut rooms = RelayRooms::new();
        let now = Utc::now();
        rooms.handle(1, alice(), Envelope::join(&group(), None, None), now);
        rooms.handle(2, bob(), Envelope::join(&group(), None, None), now);

        rooms.handle(2, bob(), Envelope::state(&group(), None, StateMessage::dirty(true)), now);
        assert_eq!(rooms.state_of(&group(), "bob").unwrap().dirty, Some(true));

        let out = rooms.handle(2, bob(), Envelope::state(&group(), None, StateMessage::version(3)), now);
        let state = rooms.state_of(&group(), "bob").unwrap();
        assert_eq!(state.version, Some(3));
        assert_eq!(state.dirty, Some(false));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, 1);
    }

    #[test]
    fn test_left_broadcasts_and_drops_empty_rooms() {
        let mut rooms = RelayRooms::new();
        let now = Utc::now();
        rooms.handle(1, alice(), Envelope::join(&group(), None, None), now);
        rooms.handle(2, bob(), Envelope::join(&group(), None, None), now);

        let out = rooms.handle(2, bob(), Envelope::left(&group(), None), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, 1);
        assert_eq!(out[0].envelope.command(), Command::Left);
        assert!(rooms.state_of(&group(), "bob").is_none());

        let out = rooms.handle(1, alice(), Envelope::left(&group(), None), now);
        assert!(out.is_empty());
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_disconnect_leaves_every_room() {
        let mut rooms = RelayRooms::new();
        let now = Utc::now();
        let order = GroupKey::new("Order", 7);

        rooms.handle(1, alice(), Envelope::join(&group(), None, None), now);
        rooms.handle(1, alice(), Envelope::join(&order, None, None), now);
        rooms.handle(2, bob(), Envelope::join(&group(), None, None), now);
        rooms.handle(2, bob(), Envelope::join(&order, None, None), now);

        let out = rooms.disconnect(2);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.to == 1 && d.envelope.command() == Command::Left));
        assert_eq!(rooms.members(&group()), vec![1]);
        assert_eq!(rooms.members(&order), vec![1]);
    }

    #[test]
    fn test_hidden_connections_receive_nothing() {
        let mut rooms = RelayRooms::new();
        let now = Utc::now();
        rooms.set_can_view(1, false);

        let out = rooms.handle(1, alice(), Envelope::join(&group(), None, None), now);
        assert!(out.is_empty());

        let out = rooms.handle(2, bob(), Envelope::join(&group(), None, None), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, 2);
    }
}

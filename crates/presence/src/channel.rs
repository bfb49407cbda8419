/// Transport seam between the registry and the relay
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::relay::{ConnectionId, Delivery, RelayRooms};
use crate::{Clock, Envelope, PresenceError, Result, SystemClock, User};

/// Something that arrived on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(Envelope),
    /// The transport (re)established its connection
    Connected,
}

/// Outbound half of a presence transport.
///
/// Inbound traffic is delivered separately as a stream of [`ChannelEvent`]s,
/// handed out when the channel is created. Dropping that receiver unsubscribes.
pub trait PresenceChannel: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<()>;
}

impl<C: PresenceChannel + ?Sized> PresenceChannel for Arc<C> {
    fn send(&self, envelope: Envelope) -> Result<()> {
        (**self).send(envelope)
    }
}

/// Channel that only remembers what was sent
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Envelope>>,
    fail: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Envelope> {
        lock(&self.sent).clone()
    }

    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Make subsequent sends fail, as a dropped connection would
    pub fn set_failing(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }
}

impl PresenceChannel for RecordingChannel {
    fn send(&self, envelope: Envelope) -> Result<()> {
        if *lock(&self.fail) {
            return Err(PresenceError::Channel("channel is closed".to_string()));
        }
        lock(&self.sent).push(envelope);
        Ok(())
    }
}

struct HubClient {
    user: User,
    events: mpsc::UnboundedSender<ChannelEvent>,
    online: bool,
}

struct HubInner {
    rooms: RelayRooms,
    clients: HashMap<ConnectionId, HubClient>,
    next_id: ConnectionId,
}

/// In-process relay. Every [`MemoryChannel`] connected to the same hub sees
/// the others exactly as it would through a real relay server.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryHub {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                rooms: RelayRooms::new(),
                clients: HashMap::new(),
                next_id: 1,
            })),
            clock,
        }
    }

    /// Connect a client. The receiver starts with a `Connected` event.
    pub fn connect(
        &self,
        user: User,
        can_view: bool,
    ) -> (MemoryChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        let id = inner.next_id;
        inner.next_id += 1;
        inner.rooms.set_can_view(id, can_view);
        let _ = tx.send(ChannelEvent::Connected);
        inner.clients.insert(
            id,
            HubClient {
                user,
                events: tx,
                online: true,
            },
        );
        debug!("Memory client {} connected", id);

        (
            MemoryChannel {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Drop a client's connection; the others see it leave every room
    pub fn disconnect(&self, id: ConnectionId) {
        let mut inner = lock(&self.inner);
        let Some(client) = inner.clients.get_mut(&id) else {
            return;
        };
        client.online = false;
        let deliveries = inner.rooms.disconnect(id);
        inner.deliver(deliveries);
        debug!("Memory client {} disconnected", id);
    }

    pub fn reconnect(&self, id: ConnectionId, can_view: bool) {
        let mut inner = lock(&self.inner);
        inner.rooms.set_can_view(id, can_view);
        if let Some(client) = inner.clients.get_mut(&id) {
            client.online = true;
            let _ = client.events.send(ChannelEvent::Connected);
            debug!("Memory client {} reconnected", id);
        }
    }

    pub fn members(&self, group: &crate::GroupKey) -> Vec<ConnectionId> {
        lock(&self.inner).rooms.members(group)
    }

    fn route(&self, from: ConnectionId, envelope: Envelope) -> Result<()> {
        let mut inner = lock(&self.inner);
        let user = match inner.clients.get(&from) {
            Some(client) if client.online => client.user.clone(),
            _ => {
                return Err(PresenceError::Channel(format!(
                    "client {from} is not connected"
                )))
            }
        };
        let deliveries = inner.rooms.handle(from, user, envelope, self.clock.now());
        inner.deliver(deliveries);
        Ok(())
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl HubInner {
    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let Some(client) = self.clients.get(&delivery.to) else {
                continue;
            };
            if !client.online {
                continue;
            }
            if client
                .events
                .send(ChannelEvent::Message(delivery.envelope))
                .is_err()
            {
                warn!("Memory client {} dropped its subscription", delivery.to);
            }
        }
    }
}

/// One client's handle on a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryChannel {
    id: ConnectionId,
    hub: MemoryHub,
}

impl MemoryChannel {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl PresenceChannel for MemoryChannel {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.hub.route(self.id, envelope)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

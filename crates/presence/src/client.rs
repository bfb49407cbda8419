/// Async driver that owns a registry
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{ChannelEvent, Clock, PresenceChannel, PresenceRegistry};

/// Feeds channel events and throttle deadlines into a shared registry.
///
/// Local changes go through [`PresenceClient::update`] so the driver wakes up
/// when a throttled value starts waiting.
pub struct PresenceClient<C: PresenceChannel> {
    registry: Arc<Mutex<PresenceRegistry<C>>>,
    wake: Arc<Notify>,
}

impl<C: PresenceChannel> Clone for PresenceClient<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<C: PresenceChannel + 'static> PresenceClient<C> {
    pub fn new(registry: PresenceRegistry<C>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Run `f` against the registry and let the driver re-check its deadline
    pub async fn update<R>(&self, f: impl FnOnce(&mut PresenceRegistry<C>) -> R) -> R {
        let result = {
            let mut registry = self.registry.lock().await;
            f(&mut registry)
        };
        self.wake.notify_one();
        result
    }

    pub async fn lock(&self) -> MutexGuard<'_, PresenceRegistry<C>> {
        self.registry.lock().await
    }

    pub fn spawn(&self, events: mpsc::UnboundedReceiver<ChannelEvent>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run(events).await })
    }

    /// Process events until the subscription closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        loop {
            let wait = {
                let registry = self.registry.lock().await;
                registry.next_deadline().map(|at| {
                    (at - registry.clock().now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
            };

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Presence subscription closed, stopping driver");
                        return;
                    };
                    self.registry.lock().await.handle_event(event);
                }
                _ = sleep_for(wait) => {
                    self.registry.lock().await.flush_throttled();
                }
                _ = self.wake.notified() => {}
            }
        }
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

//! WebSocket transport.
//!
//! Keeps one connection to a relay alive in a background task, reconnecting
//! with a fixed pause whenever it drops. Each successful handshake is reported
//! as [`ChannelEvent::Connected`] so the registry can rejoin its groups.
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{ChannelEvent, Envelope, PresenceChannel, PresenceConfig, PresenceError, Result};

#[derive(Debug, Clone)]
pub struct WsChannel {
    outgoing: mpsc::UnboundedSender<Envelope>,
}

impl WsChannel {
    /// Start the connection task. The task ends once both the channel and
    /// the event receiver are dropped.
    pub fn connect(
        url: impl Into<String>,
        config: &PresenceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>, JoinHandle<()>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(
            url.into(),
            config.reconnect_delay(),
            out_rx,
            event_tx,
        ));
        (Self { outgoing: out_tx }, event_rx, handle)
    }
}

impl PresenceChannel for WsChannel {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .map_err(|_| PresenceError::Channel("connection task has stopped".to_string()))
    }
}

async fn run(
    url: String,
    delay: Duration,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("Connected to {}", url);

                // Whatever was queued while offline belongs to the old connection
                let mut stale = 0;
                while outgoing.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!("Dropped {} envelopes queued while offline", stale);
                }

                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }

                let (mut sink, mut source) = stream.split();
                loop {
                    tokio::select! {
                        envelope = outgoing.recv() => {
                            let Some(envelope) = envelope else {
                                let _ = sink.close().await;
                                return;
                            };
                            let json = match envelope.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!("Failed to serialize envelope: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(json)).await {
                                warn!("Failed to send to {}: {}", url, e);
                                break;
                            }
                        }
                        message = source.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                                    Ok(envelope) => {
                                        if events.send(ChannelEvent::Message(envelope)).is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => debug!("Ignoring malformed message: {}", e),
                                },
                                Some(Ok(Message::Close(_))) | None => {
                                    info!("Connection to {} closed", url);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Connection to {} failed: {}", url, e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

//! Record presence relay
//! Fans JOIN/LEFT/STATE envelopes out to every client watching the same record

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use presence::relay::{ConnectionId, Delivery, RelayRooms};
use presence::{Clock, Envelope, SystemClock, User};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type Tx = mpsc::UnboundedSender<Message>;
type SharedRelay = Arc<RwLock<Relay>>;

#[derive(Parser)]
#[command(name = "presence-relay")]
#[command(about = "Relay for record presence: who is on a record, who is editing it")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Log filter, takes precedence over RUST_LOG
    #[arg(long)]
    log: Option<String>,
}

/// Connected client
struct Client {
    tx: Tx,
    user: Option<User>,
}

/// Relay state shared by all connections
#[derive(Default)]
struct Relay {
    rooms: RelayRooms,
    clients: HashMap<ConnectionId, Client>,
    next_id: ConnectionId,
}

impl Relay {
    fn register(&mut self, tx: Tx, can_view: bool) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.rooms.set_can_view(id, can_view);
        self.clients.insert(id, Client { tx, user: None });
        id
    }

    fn route(&mut self, from: ConnectionId, envelope: Envelope) {
        let Some(client) = self.clients.get_mut(&from) else {
            return;
        };

        // A connection keeps the identity it first announced
        if client.user.is_none() {
            client.user = envelope.user().cloned();
        }
        let Some(user) = client.user.clone() else {
            warn!("Client {} sent {} without identifying itself", from, envelope.command());
            return;
        };

        let deliveries = self.rooms.handle(from, user, envelope, SystemClock.now());
        self.deliver(deliveries);
    }

    fn unregister(&mut self, id: ConnectionId) {
        let deliveries = self.rooms.disconnect(id);
        self.clients.remove(&id);
        self.deliver(deliveries);
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let Some(client) = self.clients.get(&delivery.to) else {
                continue;
            };
            let json = match delivery.envelope.to_json() {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = client.tx.send(Message::Text(json)) {
                error!("Failed to send to client {}: {}", delivery.to, e);
            }
        }
    }
}

/// `?can_view=false` (or `0`) hides presence from a client
fn can_view_from_query(query: Option<&str>) -> bool {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "can_view")
        .map_or(true, |(_, value)| !matches!(value, "false" | "0"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("presence_relay=info,presence=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listener = TcpListener::bind(&cli.addr).await?;
    info!("Presence relay listening on: {}", cli.addr);

    let relay: SharedRelay = Arc::new(RwLock::new(Relay::default()));

    while let Ok((stream, addr)) = listener.accept().await {
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, relay.clone()));
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: SharedRelay) {
    let mut can_view = true;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        can_view = can_view_from_query(request.uri().query());
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = relay.write().await.register(tx.clone(), can_view);
    info!("Client {} connected from {}", id, addr);

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving message from {}: {}", id, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => match Envelope::parse(&text) {
                Ok(envelope) => relay.write().await.route(id, envelope),
                Err(e) => debug!("Ignoring message from {}: {}", id, e),
            },
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.write().await.unregister(id);
    send_task.abort();
    info!("Client {} disconnected", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence::{Command, GroupKey};

    fn connect(relay: &mut Relay, can_view: bool) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (relay.register(tx, can_view), rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(Envelope::parse(&text).unwrap());
        }
        out
    }

    #[test]
    fn test_can_view_query() {
        assert!(can_view_from_query(None));
        assert!(can_view_from_query(Some("token=abc")));
        assert!(can_view_from_query(Some("can_view=true")));
        assert!(!can_view_from_query(Some("token=abc&can_view=false")));
        assert!(!can_view_from_query(Some("can_view=0")));
    }

    #[test]
    fn test_route_and_disconnect() {
        let mut relay = Relay::default();
        let group = GroupKey::new("Invoice", 42);
        let (a, mut a_rx) = connect(&mut relay, true);
        let (b, mut b_rx) = connect(&mut relay, true);

        let alice = User::new(1, "alice", "Alice");
        let bob = User::new(2, "bob", "Bob");
        relay.route(a, Envelope::join(&group, Some(alice), None));
        relay.route(b, Envelope::join(&group, Some(bob), None));

        assert_eq!(received(&mut a_rx).len(), 2);
        let welcome = received(&mut b_rx);
        assert_eq!(welcome.len(), 1);
        assert_eq!(welcome[0].users().unwrap().len(), 2);

        relay.unregister(b);
        let left = received(&mut a_rx);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].command(), Command::Left);
        assert_eq!(left[0].user().unwrap().code, "bob");
    }

    #[test]
    fn test_anonymous_envelopes_are_dropped() {
        let mut relay = Relay::default();
        let group = GroupKey::new("Invoice", 42);
        let (a, mut a_rx) = connect(&mut relay, true);

        relay.route(a, Envelope::join(&group, None, None));
        assert!(received(&mut a_rx).is_empty());
        assert!(relay.rooms.members(&group).is_empty());
    }

    #[test]
    fn test_identity_is_pinned_to_first_announcement() {
        let mut relay = Relay::default();
        let group = GroupKey::new("Invoice", 42);
        let (a, _a_rx) = connect(&mut relay, true);
        let (b, mut b_rx) = connect(&mut relay, true);

        relay.route(b, Envelope::join(&group, Some(User::new(2, "bob", "Bob")), None));
        relay.route(a, Envelope::join(&group, Some(User::new(1, "alice", "Alice")), None));
        received(&mut b_rx);

        let spoofed = User::new(3, "mallory", "Mallory");
        relay.route(a, Envelope::left(&group, Some(spoofed)));
        let left = received(&mut b_rx);
        assert_eq!(left[0].user().unwrap().code, "alice");
    }
}

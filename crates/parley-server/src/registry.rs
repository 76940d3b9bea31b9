//! Connection registry: one live WebSocket per identity.
//!
//! A connection exists from socket accept to close. An identity is bound
//! to it by `register_identity`; a later bind for the same identity
//! supersedes the earlier connection in the mapping without closing its
//! socket. Unbinding compares by handle, never by identity key, so a
//! stale connection disconnecting cannot evict a newer registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use parley_core::ids::ConnectionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// A connected WebSocket client.
pub struct Connection {
    pub id: ConnectionId,
    identity: RwLock<Option<String>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            identity: RwLock::new(None),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections plus the identity → connection map.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    identities: DashMap<String, ConnectionId>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            identities: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID + outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(id.clone(), tx));
        self.connections.insert(id.clone(), conn);
        (id, rx)
    }

    /// Bind an identity to a connection, replacing any existing mapping
    /// for that identity. Returns the superseded connection handle, if
    /// any — the caller decides whether to close it.
    pub fn bind_identity(&self, id: &ConnectionId, email: &str) -> Option<ConnectionId> {
        let conn = self.connections.get(id)?;

        let old_identity = conn.identity.write().replace(email.to_string());
        if let Some(old_email) = old_identity {
            if old_email != email {
                self.identities.remove_if(&old_email, |_, v| v == id);
            }
        }
        drop(conn);

        self.identities
            .insert(email.to_string(), id.clone())
            .filter(|prev| prev != id)
    }

    /// Remove a connection. The identity mapping is dropped only when it
    /// still points at this handle; returns the freed identity in that
    /// case so the caller can purge room membership.
    pub fn unregister(&self, id: &ConnectionId) -> Option<String> {
        let (_, conn) = self.connections.remove(id)?;
        conn.connected.store(false, Ordering::Relaxed);

        let email = conn.identity()?;
        self.identities
            .remove_if(&email, |_, v| v == id)
            .map(|(email, _)| email)
    }

    /// Resolve an identity to its live connection. Absent is not an error.
    pub fn resolve(&self, email: &str) -> Option<ConnectionId> {
        let id = self.identities.get(email)?.clone();
        let conn = self.connections.get(&id)?;
        conn.is_connected().then_some(id)
    }

    pub fn identity_of(&self, id: &ConnectionId) -> Option<String> {
        self.connections.get(id)?.identity()
    }

    /// Send a message to a specific connection. Drops the message with a
    /// warning if the send queue is full.
    pub async fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(conn) = self.connections.get(id).map(|c| Arc::clone(&c)) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send to the connection currently registered for an identity.
    /// Identities with no live connection are silently skipped.
    pub async fn send_to_identity(&self, email: &str, message: String) -> bool {
        match self.resolve(email) {
            Some(id) => self.send_to(&id, message).await,
            None => false,
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Connections that stopped answering pings. The caller runs full
    /// disconnect handling for each (unregister + room purge).
    pub fn dead_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage
/// lifecycle with heartbeat. Returns when either side closes; the caller
/// performs disconnect cleanup afterwards.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward messages from channel to WebSocket + periodic ping
    let writer_cid = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader task: forward WebSocket messages to the router, track pongs
    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_registry.connections.get(&reader_cid) {
                        conn.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pings automatically
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

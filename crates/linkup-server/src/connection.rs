use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use linkup_core::ids::{ConnectionId, UserId};

use crate::presence::PresenceRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// One live WebSocket session and its server-side state.
///
/// Lifecycle is Connecting → Open → Closed: the struct is created once the
/// transport handshake completes and destroyed on disconnect. The user
/// identity is set once by the first `join` and immutable afterwards.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: Option<UserId>,
    pub groups: HashSet<String>,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: std::sync::atomic::AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        let now = now_secs();
        Self {
            id,
            user_id: None,
            groups: HashSet::new(),
            tx,
            connected: AtomicBool::new(true),
            last_pong: std::sync::atomic::AtomicU64::new(now),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
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
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID + outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Mutex::new(Connection::new(id.clone(), tx)));
        self.connections.insert(id.clone(), conn);
        (id, rx)
    }

    /// Remove a connection by ID.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            if let Ok(c) = conn.try_lock() {
                c.connected.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Bind the user identity for a connection. Returns false if the
    /// connection already carries a different identity (the bind is ignored)
    /// or is unknown.
    pub async fn bind_user(&self, id: &ConnectionId, user_id: &UserId) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        let mut conn = conn.lock().await;
        match &conn.user_id {
            None => {
                conn.user_id = Some(user_id.clone());
                true
            }
            Some(existing) => existing == user_id,
        }
    }

    /// The identity bound to a connection, if joined.
    pub async fn user_of(&self, id: &ConnectionId) -> Option<UserId> {
        let conn = self.connections.get(id)?;
        let conn = conn.lock().await;
        conn.user_id.clone()
    }

    /// Add a connection to a broadcast group.
    pub async fn join_group(&self, id: &ConnectionId, group: &str) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        let inserted = conn.lock().await.groups.insert(group.to_string());
        inserted
    }

    /// Send a message to a specific connection. Returns false when the
    /// connection is gone or its queue is full (the frame is dropped).
    pub async fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        if let Some(conn) = self.connections.get(id) {
            let tx = conn.lock().await.tx.clone();
            match tx.try_send(message) {
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
        } else {
            false
        }
    }

    /// Push a frame to every member of a group, best-effort. Returns the
    /// number of members it reached; an empty group is a no-op.
    pub fn broadcast_to_group(&self, group: &str, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if let Ok(conn) = entry.value().try_lock() {
                if conn.groups.contains(group) && conn.is_connected() {
                    if conn.tx.try_send(message.to_string()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections that haven't answered pings within the timeout.
    /// Presence entries are cleaned alongside, as in the disconnect path.
    pub fn cleanup_dead_connections(&self, presence: &PresenceRegistry) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter_map(|entry| {
                if let Ok(conn) = entry.value().try_lock() {
                    if !conn.is_alive() {
                        return Some(conn.id.clone());
                    }
                }
                None
            })
            .collect();

        let mut removed = 0;
        for id in dead {
            presence.unregister(&id);
            self.unregister(&id);
            removed += 1;
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        removed
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle
/// with heartbeat. On exit the presence entry is removed in the same step as
/// the connection itself, so no concurrent send can observe a stale entry.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceRegistry>,
    on_event: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward frames from channel to WebSocket + periodic ping
    let writer_cid = connection_id.clone();
    let writer_registry = Arc::clone(&registry);
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

        // Mark as disconnected
        if let Some(conn) = writer_registry.connections.get(&writer_cid) {
            if let Ok(c) = conn.try_lock() {
                c.connected.store(false, Ordering::Relaxed);
            }
        }
    });

    // Reader task: forward inbound frames to the event loop, track pongs
    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_event.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_registry.connections.get(&reader_cid) {
                        if let Ok(c) = conn.try_lock() {
                            c.record_pong();
                        }
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pongs automatically
                _ => {}
            }
        }
    });

    // Wait for either side to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    presence.unregister(&connection_id);
    registry.unregister(&connection_id);
    tracing::info!(connection_id = %connection_id, "connection closed");
}

/// Start a background task that periodically cleans up dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections(&presence);
            if removed > 0 {
                tracing::info!(removed = removed, "dead connection cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_register_and_unregister() {
        let registry = ConnectionRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);

        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn bind_user_is_set_once() {
        let registry = ConnectionRegistry::new(32);
        let (id, _rx) = registry.register();

        let alice = UserId::from_raw("alice");
        let bob = UserId::from_raw("bob");

        assert!(registry.bind_user(&id, &alice).await);
        // Re-join with the same identity is fine
        assert!(registry.bind_user(&id, &alice).await);
        // A different identity on a live session is refused
        assert!(!registry.bind_user(&id, &bob).await);

        assert_eq!(registry.user_of(&id).await, Some(alice));
    }

    #[tokio::test]
    async fn bind_user_unknown_connection() {
        let registry = ConnectionRegistry::new(32);
        let ghost = ConnectionId::new();
        assert!(!registry.bind_user(&ghost, &UserId::from_raw("x")).await);
        assert_eq!(registry.user_of(&ghost).await, None);
    }

    #[tokio::test]
    async fn send_to_specific_connection() {
        let registry = ConnectionRegistry::new(32);
        let (id, mut rx) = registry.register();

        let sent = registry.send_to(&id, "test message".into()).await;
        assert!(sent);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, "test message");
    }

    #[tokio::test]
    async fn send_to_nonexistent_connection() {
        let registry = ConnectionRegistry::new(32);
        let fake = ConnectionId::new();
        let sent = registry.send_to(&fake, "test".into()).await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn send_to_full_queue_drops() {
        let registry = ConnectionRegistry::new(2); // tiny queue
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "msg1".into()).await);
        assert!(registry.send_to(&id, "msg2".into()).await);

        // Queue is full — this one is dropped
        assert!(!registry.send_to(&id, "msg3".into()).await);
    }

    #[tokio::test]
    async fn broadcast_reaches_group_members_only() {
        let registry = ConnectionRegistry::new(32);
        let (id1, mut rx1) = registry.register();
        let (id2, mut rx2) = registry.register();
        let (_id3, mut rx3) = registry.register();

        assert!(registry.join_group(&id1, "dashboard").await);
        assert!(registry.join_group(&id2, "dashboard").await);

        let delivered = registry.broadcast_to_group("dashboard", "snapshot");
        assert_eq!(delivered, 2);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_empty_group_is_noop() {
        let registry = ConnectionRegistry::new(32);
        let (_id, mut rx) = registry.register();

        let delivered = registry.broadcast_to_group("dashboard", "snapshot");
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_group_twice_is_idempotent() {
        let registry = ConnectionRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.join_group(&id, "dashboard").await);
        assert!(!registry.join_group(&id, "dashboard").await); // already a member

        let delivered = registry.broadcast_to_group("dashboard", "once");
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleanup_dead_connections_removes_expired_and_presence() {
        let registry = ConnectionRegistry::new(32);
        let presence = PresenceRegistry::new();
        let (id, _rx) = registry.register();
        presence.register(&UserId::from_raw("alice"), &id);

        // Pretend the last pong was ages ago
        if let Some(conn) = registry.connections.get(&id) {
            if let Ok(c) = conn.try_lock() {
                c.last_pong.store(0, Ordering::Relaxed);
            }
        }

        let removed = registry.cleanup_dead_connections(&presence);
        assert_eq!(removed, 1);
        assert_eq!(registry.count(), 0);
        assert!(!presence.is_online(&UserId::from_raw("alice")));
    }

    #[test]
    fn connection_pong_tracking() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), tx);
        assert!(conn.is_alive());

        conn.record_pong();
        assert!(conn.is_alive());
    }
}

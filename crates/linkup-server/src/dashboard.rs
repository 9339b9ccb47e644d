use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use linkup_core::events::ServerEvent;
use linkup_store::{ConversationRepo, DirectoryRepo};

use crate::connection::ConnectionRegistry;
use crate::presence::PresenceRegistry;

/// Name of the opt-in broadcast group for admin dashboards.
pub const DASHBOARD_GROUP: &str = "dashboard";

/// Capacity of the dashboard broadcast channel. Slow consumers that fall
/// behind skip payloads (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 256;

/// Push-based cache invalidation for admin dashboards.
///
/// External CRUD mutations call `publish` after a write; a bridge task
/// forwards each payload as a `dashboard-update` frame to every current
/// member of the dashboard group, best-effort. Cloneable — hand one to
/// whoever mutates platform state.
#[derive(Clone)]
pub struct DashboardBroadcast {
    tx: broadcast::Sender<Value>,
}

impl Default for DashboardBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Queue a payload for every dashboard subscriber. No receivers is fine.
    pub fn publish(&self, data: Value) {
        let _ = self.tx.send(data);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

/// Forward published payloads to the dashboard group until the channel closes.
pub fn start_bridge(
    registry: Arc<ConnectionRegistry>,
    mut rx: broadcast::Receiver<Value>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(data) => {
                    let event = ServerEvent::DashboardUpdate(data);
                    if let Some(json) = event.to_wire() {
                        registry.broadcast_to_group(DASHBOARD_GROUP, &json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "dashboard bridge lagged, dropped payloads");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("dashboard broadcast channel closed");
                    break;
                }
            }
        }
    })
}

/// Read models the periodic snapshot aggregates over.
pub struct SnapshotSources {
    pub directory: Arc<DirectoryRepo>,
    pub conversations: Arc<ConversationRepo>,
    pub presence: Arc<PresenceRegistry>,
    pub connections: Arc<ConnectionRegistry>,
}

/// Current platform activity as a dashboard payload.
pub fn activity_snapshot(sources: &SnapshotSources) -> Value {
    json!({
        "users": sources.directory.count().unwrap_or(0),
        "online": sources.presence.online_count(),
        "conversations": sources.conversations.count().unwrap_or(0),
        "connections": sources.connections.count(),
    })
}

/// Push an activity snapshot to the dashboard group on an interval.
pub fn start_snapshot_task(
    hub: DashboardBroadcast,
    sources: SnapshotSources,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            hub.publish(activity_snapshot(&sources));
        }
    })
}

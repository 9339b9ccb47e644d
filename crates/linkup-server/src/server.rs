use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use linkup_core::events::ClientEvent;
use linkup_core::ids::ConnectionId;
use linkup_core::provider::GenerationProvider;
use linkup_store::{ConversationRepo, Database, DirectoryRepo};
use linkup_telemetry::MetricsRecorder;

use crate::bridge::StreamingBridge;
use crate::chat;
use crate::connection::{self, ConnectionRegistry};
use crate::dashboard::{self, DashboardBroadcast, SnapshotSources};
use crate::events;
use crate::presence::PresenceRegistry;
use crate::router::MessageRouter;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub cleanup_interval_secs: u64,
    pub snapshot_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            max_send_queue: 256,
            cleanup_interval_secs: 60,
            snapshot_interval_secs: 30,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceRegistry>,
    pub conversations: Arc<ConversationRepo>,
    pub directory: Arc<DirectoryRepo>,
    pub bridge: Arc<StreamingBridge>,
    pub dashboard: DashboardBroadcast,
    pub event_tx: mpsc::Sender<(ConnectionId, String)>,
}

impl AppState {
    pub fn activity_snapshot(&self) -> Value {
        dashboard::activity_snapshot(&self.snapshot_sources())
    }

    /// Push the current aggregate snapshot to dashboard subscribers.
    /// Called after every write this service owns; external CRUD
    /// collaborators publish through the same hub.
    pub fn publish_snapshot(&self) {
        self.dashboard.publish(self.activity_snapshot());
    }

    fn snapshot_sources(&self) -> SnapshotSources {
        SnapshotSources {
            directory: Arc::clone(&self.directory),
            conversations: Arc::clone(&self.conversations),
            presence: Arc::clone(&self.presence),
            connections: Arc::clone(&self.registry),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/dashboard", get(chat::dashboard_snapshot))
        .route(
            "/api/chat/conversations",
            get(chat::list_conversations).post(chat::create_conversation),
        )
        .route("/api/chat/conversations/{id}", get(chat::get_conversation))
        .route(
            "/api/chat/conversations/{id}/messages",
            get(chat::list_messages),
        )
        .route(
            "/api/chat/conversations/{id}/message",
            post(chat::post_message),
        )
        .route("/api/chat/conversations/{id}/ai", post(chat::ai_reply))
        .route("/api/users/{id}", put(chat::upsert_user))
        .route("/api/users/{id}/status", get(chat::user_status))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    provider: Arc<dyn GenerationProvider>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let presence = Arc::new(PresenceRegistry::new());
    let router = MessageRouter::new(Arc::clone(&presence));
    let conversations = Arc::new(ConversationRepo::new(db.clone()));
    let directory = Arc::new(DirectoryRepo::new(db));

    let bridge = Arc::new(
        StreamingBridge::new(provider, Arc::clone(&conversations)).with_metrics(metrics.clone()),
    );

    // Dashboard hub + bridge task
    let dashboard_hub = DashboardBroadcast::new();
    let dashboard_handle =
        dashboard::start_bridge(Arc::clone(&registry), dashboard_hub.subscribe());

    // Dead-connection cleanup task
    let cleanup_handle = connection::start_cleanup_task(
        Arc::clone(&registry),
        Arc::clone(&presence),
        Duration::from_secs(config.cleanup_interval_secs),
    );

    // Inbound event channel: events from one connection arrive in receipt
    // order; the loop task serializes handling across connections.
    let (event_tx, event_rx) = mpsc::channel::<(ConnectionId, String)>(1024);

    let app_state = AppState {
        registry: Arc::clone(&registry),
        presence: Arc::clone(&presence),
        conversations: Arc::clone(&conversations),
        directory: Arc::clone(&directory),
        bridge,
        dashboard: dashboard_hub.clone(),
        event_tx,
    };

    // Periodic activity snapshot for dashboard subscribers
    let snapshot_handle = dashboard::start_snapshot_task(
        dashboard_hub.clone(),
        app_state.snapshot_sources(),
        Duration::from_secs(config.snapshot_interval_secs),
    );

    let loop_handle = tokio::spawn(event_loop(
        event_rx,
        Arc::clone(&registry),
        Arc::clone(&presence),
        router,
        metrics,
    ));

    let axum_router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "linkup server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, axum_router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        dashboard: dashboard_hub,
        _server: server_handle,
        _event_loop: loop_handle,
        _dashboard_bridge: dashboard_handle,
        _cleanup: cleanup_handle,
        _snapshot: snapshot_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    /// In-process collaborators publish dashboard payloads through this.
    pub dashboard: DashboardBroadcast,
    _server: tokio::task::JoinHandle<()>,
    _event_loop: tokio::task::JoinHandle<()>,
    _dashboard_bridge: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
    _snapshot: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "client connected");

    connection::handle_ws_connection(
        socket,
        connection_id,
        rx,
        state.registry,
        state.presence,
        state.event_tx,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
        "online": state.presence.online_count(),
    }))
}

/// The single event loop: parses inbound frames, dispatches them, and
/// executes the resulting deliveries. Handlers never block the loop; the
/// only awaits are registry sends, which are bounded try_sends underneath.
async fn event_loop(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceRegistry>,
    router: MessageRouter,
    metrics: Option<Arc<MetricsRecorder>>,
) {
    while let Some((connection_id, raw)) = rx.recv().await {
        let event: ClientEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                // Malformed events are non-fatal: log and keep the session open
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "ignoring malformed event"
                );
                continue;
            }
        };

        let is_message = matches!(event, ClientEvent::SendMessage { .. });
        let deliveries = events::dispatch(event, &connection_id, &registry, &presence, &router).await;

        if is_message {
            if let Some(metrics) = &metrics {
                metrics.counter_inc("messages.routed", &[], 1);
            }
        }

        for delivery in deliveries {
            if let Some(json) = delivery.event.to_wire() {
                registry.send_to(&delivery.target, json).await;
            }
        }
    }
}

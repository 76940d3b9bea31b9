use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use parley_core::ids::ConnectionId;
use parley_core::protocol::ServerEvent;
use parley_enrich::EnrichmentService;
use parley_store::Database;

use crate::registry::{self, ConnectionRegistry};
use crate::rooms::RoomTable;
use crate::router::MessageRouter;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub registry: Arc<ConnectionRegistry>,
    pub db: Database,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    enrich: Arc<EnrichmentService>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let rooms = Arc::new(RoomTable::new());
    let router = Arc::new(MessageRouter::new(
        db.clone(),
        Arc::clone(&registry),
        rooms,
        enrich,
    ));

    // Inbound event channel: one processing loop for all connections.
    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let events_handle = tokio::spawn(process_events(msg_rx, Arc::clone(&router)));

    // Periodic sweep for connections that stopped answering pings.
    let cleanup_handle = tokio::spawn(cleanup_loop(
        Arc::clone(&registry),
        Arc::clone(&router),
        CLEANUP_INTERVAL,
    ));

    let state = AppState {
        router,
        registry,
        db,
        message_tx: msg_tx,
    };

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "parley server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _events: events_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _events: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection from accept to cleanup.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "client connected");

    // Greeting, matching what clients expect on connect.
    let greeting = ServerEvent::Connected {
        status: "Connected to server".into(),
    };
    if let Ok(json) = serde_json::to_string(&greeting) {
        state.registry.send_to(&connection_id, json).await;
    }

    registry::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.registry),
        state.message_tx.clone(),
    )
    .await;

    state.router.handle_disconnect(&connection_id);
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")
                .map_err(|e| parley_store::StoreError::Database(e.to_string()))?;
            Ok(true)
        })
        .unwrap_or(false);

    let status = if db_ok { "healthy" } else { "degraded" };
    let http_status = if db_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        axum::Json(serde_json::json!({
            "status": status,
            "components": {
                "database": if db_ok { "ok" } else { "error" },
            },
            "connections": state.registry.count(),
        })),
    )
}

/// Process inbound frames from all WebSocket connections.
async fn process_events(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    router: Arc<MessageRouter>,
) {
    while let Some((connection_id, raw)) = rx.recv().await {
        router.handle_raw(&connection_id, &raw).await;
    }
}

/// Periodically run full disconnect handling for dead connections.
async fn cleanup_loop(
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let dead = registry.dead_connections();
        if !dead.is_empty() {
            tracing::info!(count = dead.len(), "cleaning up dead connections");
        }
        for connection_id in dead {
            router.handle_disconnect(&connection_id);
        }
    }
}

//! HTTP and WebSocket handlers.
//!
//! Every upgraded socket becomes an `AxumConnection` served against the
//! shared room hub until it closes.

use crate::config::{Config, StoreBackend};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredStore};
use crate::redis_store::RedisStore;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use widgetbus_core::{serve, HubConfig, MemoryStore, RoomHub, RoomStore};
use widgetbus_protocol::PROTOCOL_VERSION;
use widgetbus_transport::AxumConnection;

/// Shared server state.
pub struct AppState {
    /// The broadcast hub.
    pub hub: Arc<RoomHub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over an already-built store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn RoomStore>) -> Self {
        let hub = RoomHub::new(
            HubConfig {
                default_room: config.rooms.default_room.clone(),
            },
            Arc::new(MeteredStore::new(store)),
        );

        Self {
            hub: Arc::new(hub),
            config,
        }
    }
}

/// Build the configured persistence backend.
///
/// # Errors
///
/// Returns an error if the Redis URL is invalid.
pub async fn build_store(config: &Config) -> Result<Arc<dyn RoomStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory room store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::new(&config.store.redis_url)
                .context("Failed to create Redis store")?;
            // Writes are best-effort, so an unreachable server is not fatal.
            match store.ping().await {
                Ok(()) => info!(url = %config.store.redis_url, "Using Redis room store"),
                Err(e) => warn!(url = %config.store.redis_url, error = %e, "Redis not reachable yet"),
            }
            Ok(Arc::new(store))
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = build_store(&config).await?;
    let state = Arc::new(AppState::new(config.clone(), store));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("widgetbus listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    metrics::record_hub(&stats);

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connections,
        "rooms": stats.rooms,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max = state.config.transport.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new();
            let conn = AxumConnection::new(socket, Some(remote.to_string()), max);

            let summary = serve(Box::new(conn), state.hub.clone()).await;
            metrics::record_session(&summary);
            metrics::record_hub(&state.hub.stats().await);
        })
}

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::channel::PeerHandle;
use crate::config::ServerConfig;
use crate::registry::ClientRegistry;
use crate::session::ConnectionSession;
use crate::websocket::{WsSink, WsSource};

struct AppState {
    registry: ClientRegistry,
    max_connection_lifetime: Duration,
    shutdown: watch::Receiver<bool>,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    registered_clients: usize,
}

/// A bound, not yet serving, relay.
pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
    ws_path: String,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub async fn bind(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        Self::bind_with_registry(config, ClientRegistry::new(), metrics).await
    }

    /// Binds the listener around a caller-supplied registry.
    pub async fn bind_with_registry(
        config: &ServerConfig,
        registry: ClientRegistry,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .context("failed to bind listener")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState {
            registry,
            max_connection_lifetime: config.max_connection_lifetime,
            shutdown: shutdown_rx,
            metrics,
        });

        Ok(Self {
            listener,
            state,
            ws_path: config.ws_path.clone(),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn registry(&self) -> ClientRegistry {
        self.state.registry.clone()
    }

    /// Serves until `signal` resolves, then cancels every open session.
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            state,
            ws_path,
            shutdown_tx,
        } = self;

        let local_addr = listener.local_addr().ok();
        let app = router(state, &ws_path);
        info!(local_addr = ?local_addr, ws_path = %ws_path, "beach-beacon listening");

        let shutdown = async move {
            signal.await;
            info!("shutdown requested; cancelling open sessions");
            let _ = shutdown_tx.send(true);
        };

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
    }
}

fn router(state: Arc<AppState>, ws_path: &str) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        registered_clients: state.registry.len(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let (sink, stream) = socket.split();
    let handle = PeerHandle::new(Arc::new(WsSink::new(sink)));
    let connection_id = handle.connection_id();
    let source = WsSource::new(
        stream,
        state.max_connection_lifetime,
        state.shutdown.clone(),
    );

    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        "websocket connection established"
    );

    let outcome = ConnectionSession::new(state.registry.clone(), handle, source)
        .run()
        .await;

    debug!(connection_id = %connection_id, outcome = ?outcome, "session finished");
}

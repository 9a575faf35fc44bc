//! HTTP handlers for the Parley server.
//!
//! Serves the WebSocket endpoint plus `/health` and `/stats`, and owns the
//! graceful shutdown sequence.

use crate::config::Config;
use crate::metrics;
use crate::session;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::Router as ParleyRouter;
use parley_transport::WebSocketConnection;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: ParleyRouter,
    /// Server configuration.
    pub config: Config,
    /// Flips to `true` when the server starts shutting down.
    pub shutdown: watch::Sender<bool>,
    /// Sessions still running, including ones flushing after disconnect.
    sessions: watch::Sender<usize>,
    started_at: Instant,
}

/// Marks a session as running until dropped.
pub struct SessionSlot {
    state: Arc<AppState>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.state.sessions.send_modify(|running| *running -= 1);
    }
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (sessions, _) = watch::channel(0);

        Self {
            router: ParleyRouter::with_config(config.router_config()),
            config,
            shutdown,
            sessions,
            started_at: Instant::now(),
        }
    }

    /// Reserve a session slot, unless `max_connections` sessions are
    /// already running. The session counts as running until the slot drops.
    #[must_use]
    pub fn try_enter_session(self: &Arc<Self>) -> Option<SessionSlot> {
        let limit = self.config.limits.max_connections;
        let reserved = self.sessions.send_if_modified(|running| {
            if *running < limit {
                *running += 1;
                true
            } else {
                false
            }
        });

        reserved.then(|| SessionSlot {
            state: Arc::clone(self),
        })
    }

    /// Number of sessions still running, including ones flushing after
    /// disconnect.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    /// Wait until no session is running.
    pub async fn sessions_drained(&self) {
        let mut running = self.sessions.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = running.wait_for(|running| *running == 0).await;
    }

    /// Time since the server started.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config)), shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves, then let
/// open sessions flush for up to the configured grace period.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = app(Arc::clone(&state));

    let signal_state = Arc::clone(&state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down, closing open sessions");
        signal_state.shutdown.send_replace(true);
    })
    .await?;

    // Upgraded sockets outlive the HTTP server; wait for their sessions
    let grace = state.config.shutdown.grace_period();
    let drained = tokio::time::timeout(grace, state.sessions_drained()).await;

    match drained {
        Ok(()) => info!("All sessions closed"),
        Err(_) => warn!(
            remaining = state.active_sessions(),
            "Grace period elapsed with sessions still open"
        ),
    }

    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.router.hub().connection_count(),
        "uptimeSeconds": state.uptime().as_secs(),
    }))
}

/// Router statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    metrics::record_router_stats(&stats);
    Json(stats)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(slot) = state.try_enter_session() else {
        let limit = state.config.limits.max_connections;
        warn!(remote = %addr, limit, "Connection limit reached, refusing upgrade");
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    // The slot is held from here, so a failed upgrade releases it on drop
    let max_message_size = state.config.limits.max_message_size;
    ws.on_upgrade(move |socket| {
        let conn = WebSocketConnection::new(socket, max_message_size).with_remote_addr(addr);
        session::run(conn, state, slot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_limit(limit: usize) -> Arc<AppState> {
        let mut config = Config::default();
        config.limits.max_connections = limit;
        Arc::new(AppState::new(config))
    }

    #[test]
    fn test_session_slots_respect_limit() {
        let state = state_with_limit(2);

        let first = state.try_enter_session();
        let second = state.try_enter_session();
        assert!(first.is_some() && second.is_some());
        assert!(state.try_enter_session().is_none());
        assert_eq!(state.active_sessions(), 2);

        drop(first);
        let third = state.try_enter_session();
        assert!(third.is_some());

        drop((second, third));
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_concurrent_reservations_stop_at_limit() {
        let state = state_with_limit(8);

        let slots: Vec<SessionSlot> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| scope.spawn(|| state.try_enter_session()))
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(slots.len(), 8);
        assert_eq!(state.active_sessions(), 8);
    }

    #[tokio::test]
    async fn test_sessions_drained_wakes_on_last_slot() {
        let state = state_with_limit(4);
        tokio::time::timeout(Duration::from_secs(1), state.sessions_drained())
            .await
            .unwrap();

        let slot = state.try_enter_session().unwrap();
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.sessions_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

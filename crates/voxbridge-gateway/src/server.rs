//! Axum server: WebSocket upgrade, provisioning, health, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{any, get},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use voxbridge_core::protocol::SUBPROTOCOLS;

use crate::auth::AuthGate;
use crate::provisioning::ota_handler;
use crate::session::{SessionContext, run_session};
use crate::state::GatewayState;

/// Build the gateway router. Split out so tests can bind their own
/// listener.
pub async fn router(state: Arc<GatewayState>) -> Router {
    let config = state.config_snapshot().await;

    Router::new()
        .route(&config.server.ws_path, get(ws_handler))
        .route("/xiaozhi/ota/", any(ota_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until a shutdown signal, then drain sessions with a
/// 3-second join budget.
pub async fn run_server(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let config = state.config_snapshot().await;
    let addr = format!("{}:{}", config.server.bind, config.server.port);

    let app = router(state.clone()).await;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("voxbridge listening on {addr} (ws path {})", config.server.ws_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    drain_sessions(&state, Duration::from_secs(3)).await;
    Ok(())
}

async fn drain_sessions(state: &Arc<GatewayState>, budget: Duration) {
    state.cancel_all_sessions().await;
    let deadline = Instant::now() + budget;
    while state.connection_count().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let remaining = state.connection_count().await;
    if remaining > 0 {
        warn!(remaining, "Sessions still open after shutdown budget");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let config = state.config_snapshot().await;

    let gate = AuthGate::from_config(&config.auth);
    let principal = match gate.authenticate(&headers) {
        Ok(principal) => principal,
        Err(e) => {
            warn!(error = %e, "Rejected connection");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let providers = match state.providers().await {
        Ok(providers) => providers,
        Err(e) => {
            warn!(error = %e, "Provider initialization failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    ws.protocols(SUBPROTOCOLS)
        .on_upgrade(move |socket| {
            run_session(
                SessionContext {
                    state,
                    config,
                    providers,
                    principal,
                },
                socket,
            )
        })
        .into_response()
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.connection_count().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "connections": connections,
    }))
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    state.shutdown.cancel();
}

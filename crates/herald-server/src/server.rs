use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use herald_engine::Engine;

/// Status server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
            request_timeout_secs: 60,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub started_at: DateTime<Utc>,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/topics", get(topics_handler))
        .route("/reconcile", post(reconcile_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `cancel` fires.
pub async fn start(
    config: ServerConfig,
    engine: Arc<Engine>,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        engine,
        started_at: Utc::now(),
    };
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "status server started");

    let server = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!(error = %e, "status server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server to finish after its cancel token fired.
    pub async fn join(self) {
        let _ = self.server.await;
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "topics": state.engine.topics().len(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn topics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.topics())
}

/// The pass runs on its own task so a request timeout cannot cut it short
/// between the store write and the duplicate closes.
async fn reconcile_handler(State(state): State<AppState>) -> impl IntoResponse {
    let engine = Arc::clone(&state.engine);
    match tokio::spawn(async move { engine.reconcile().await }).await {
        Ok(Ok(report)) => (StatusCode::OK, Json(json!(report))),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, kind = e.error_kind(), "on-demand reconcile failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "kind": e.error_kind() })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "reconcile task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "kind": "internal" })),
            )
        }
    }
}

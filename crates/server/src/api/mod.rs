use crate::config::AppState;
use crate::middleware::auth;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mcpod_core::{AdapterSettings, UniversalAdapter};
use mcpod_mcp::{JsonRpcError, JsonRpcResponse};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the HTTP server, then bring the adapter up behind it.
///
/// Requests are answered with 503 until initialization finishes. A failed
/// initialization stops the server and is returned as the process error.
pub async fn serve(addr: &str, state: Arc<AppState>, settings: AdapterSettings) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Adapter listening on {}", addr);

    run(listener, state, settings, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves.
///
/// A shutdown that arrives while the adapter is still initializing abandons
/// the initialization; any install or child process it started is killed.
async fn run<F>(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    settings: AdapterSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state.clone());
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });

    let server_stop = stop_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(server_stop))
            .await
    });

    let initialized = tokio::select! {
        result = UniversalAdapter::initialize(settings) => Some(result),
        _ = stopped(stop_rx) => None,
    };

    let adapter = match initialized {
        Some(Ok(adapter)) => Arc::new(adapter),
        Some(Err(e)) => {
            tracing::error!("Adapter initialization failed: {}", e);
            server.abort();
            return Err(anyhow::Error::new(e).context("Adapter initialization failed"));
        }
        None => {
            tracing::info!("Shutdown requested during initialization");
            server
                .await
                .context("HTTP server task failed")?
                .context("HTTP server error")?;
            return Ok(());
        }
    };
    state.set_backend(adapter.clone());

    let served = server.await.context("HTTP server task failed")?;
    adapter.shutdown().await;
    served.context("HTTP server error")?;

    tracing::info!("Adapter stopped");
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|requested| *requested).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Create the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mcp = Router::new()
        .route("/mcp", post(handlers::mcp))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(mcp)
        // Middleware
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    match state.backend() {
        Some(backend) => Json(backend.health().await).into_response(),
        None => not_ready(),
    }
}

pub(crate) fn not_ready() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::new("Adapter not initialized")),
    )
        .into_response()
}

/// A panic while handling a request becomes a JSON-RPC internal error
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };

    tracing::error!("Request handler panicked: {}", detail);

    let response = JsonRpcResponse::error(
        serde_json::Value::Null,
        JsonRpcError::internal_error(format!("Internal error: {}", detail)),
    );
    (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
}

/// Transport-level error body, used where no JSON-RPC envelope exists yet
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }
}

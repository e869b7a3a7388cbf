//! Gateway HTTP server using axum

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use shellbox_core::{ExecutionResult, ExecutionService, SandboxError};
use shellbox_history::HistoryDb;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::protocol::{ERR_INVALID_REQUEST, ErrorBody, ExecuteRequest};

#[derive(Clone)]
struct GatewayState {
    service: Arc<ExecutionService>,
    history: Option<HistoryDb>,
    shutdown: CancellationToken,
}

/// HTTP front end for the execution service
pub struct GatewayServer {
    state: GatewayState,
}

impl GatewayServer {
    pub fn new(service: Arc<ExecutionService>, history: Option<HistoryDb>) -> Self {
        Self {
            state: GatewayState {
                service,
                history,
                shutdown: CancellationToken::new(),
            },
        }
    }

    /// Token that stops the server and cancels in-flight executions
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/execute", post(handle_execute))
            .route("/health", get(handle_health))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind `addr` and serve until the shutdown token fires
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway to {}", addr))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Gateway listening on http://{}", addr);
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Gateway server failed")?;
        info!("Gateway stopped");
        Ok(())
    }
}

/// Error returned from a handler
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        let status = if err.is_config_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            body: ErrorBody::from(&err),
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_execute(
    State(state): State<GatewayState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let Json(req) = body.map_err(|rejection| ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorBody::new(ERR_INVALID_REQUEST, rejection.body_text()),
    })?;
    debug!("Gateway: execute request for session {}", req.session());

    let result = state
        .service
        .execute(&req.request, state.shutdown.child_token())
        .await
        .inspect_err(|e| warn!("Gateway: execution rejected: {}", e))?;

    if let Some(history) = &state.history {
        record(history, &req, &result).await;
    }
    Ok(Json(result))
}

/// History failures never fail the request.
async fn record(history: &HistoryDb, req: &ExecuteRequest, result: &ExecutionResult) {
    let request = serde_json::to_value(&req.request);
    let response = serde_json::to_value(result);
    let (Ok(request), Ok(response)) = (request, response) else {
        warn!("Gateway: could not serialize history entry");
        return;
    };
    if let Err(e) = history.save(req.session(), &request, &response).await {
        warn!("Gateway: failed to record history: {:#}", e);
    }
}

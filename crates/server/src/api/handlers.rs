use super::not_ready;
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mcpod_core::McpBackend;
use mcpod_mcp::{classify, JsonRpcError, JsonRpcRequest, JsonRpcResponse, MethodKind};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of routing one JSON-RPC message
#[derive(Debug)]
pub enum McpReply {
    /// The child's response, passed through untouched
    Forwarded(Value),
    /// A JSON-RPC error produced by the adapter itself
    Error(JsonRpcResponse),
    /// Notification accepted; empty body
    Accepted,
}

impl IntoResponse for McpReply {
    fn into_response(self) -> Response {
        match self {
            Self::Forwarded(response) => (StatusCode::OK, Json(response)).into_response(),
            Self::Error(response) => (StatusCode::OK, Json(response)).into_response(),
            Self::Accepted => StatusCode::OK.into_response(),
        }
    }
}

/// JSON-RPC endpoint
pub async fn mcp(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(backend) = state.backend() else {
        return not_ready();
    };

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Unparseable request body: {}", e);
            let response = JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error());
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!("Invalid Request: {}", e)),
            );
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    dispatch(backend.as_ref(), &request).await.into_response()
}

/// Route one message per the MCP method table.
///
/// Capability calls are forwarded whether or not the matching capability list
/// is empty; the child decides what it supports.
pub async fn dispatch(backend: &dyn McpBackend, request: &JsonRpcRequest) -> McpReply {
    match classify(&request.method) {
        MethodKind::Initialize | MethodKind::Capability(_) => {
            match backend.forward_request(request).await {
                Ok(response) => McpReply::Forwarded(response),
                Err(e) => {
                    tracing::error!("Forwarding {} failed: {}", request.method, e);
                    McpReply::Error(JsonRpcResponse::error(
                        request.response_id(),
                        JsonRpcError::internal_error(format!("Internal error: {}", e)),
                    ))
                }
            }
        }
        MethodKind::Notification => {
            if let Err(e) = backend.forward_notification(request).await {
                tracing::warn!("Forwarding notification {} failed: {}", request.method, e);
            }
            McpReply::Accepted
        }
        MethodKind::Unsupported => {
            tracing::debug!("Unsupported method {}", request.method);
            McpReply::Error(JsonRpcResponse::error(
                request.response_id(),
                JsonRpcError::method_not_found(&request.method),
            ))
        }
    }
}

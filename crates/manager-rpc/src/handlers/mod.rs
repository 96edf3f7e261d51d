//! JSON-RPC request handlers, split by domain.

mod catalog;
mod operations;

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use manager_core::{EntryId, ManagerError, OperationKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND: i32 = -32601;

// ============================================================================
// JSON-RPC types
// ============================================================================

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    fn from_manager_error(id: Option<Value>, err: &ManagerError) -> Self {
        let mut response = Self::error(id, err.to_rpc_error_code(), err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = Some(json!({
                "kind": err.kind(),
                "retryable": err.is_retryable(),
            }));
        }
        response
    }
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(params: &Value, snake: &str, camel: &str) -> Result<String> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| invalid_params(format!("Missing required parameter: {}", snake)))
}

/// Extract an optional i64 parameter, supporting both snake_case and camelCase.
pub(crate) fn get_i64_param(params: &Value, snake: &str, camel: &str) -> Option<i64> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_i64())
}

/// Resolve the target entry of a call.
///
/// Accepts an `entry` identity string (`package:<reference>` or
/// `model:<save_path>/<filename>`), a bare package `reference`, or a model's
/// `save_path` and `filename`.
pub(crate) fn require_entry_id(params: &Value) -> Result<EntryId> {
    if let Some(identity) = get_str_param(params, "entry", "entryId") {
        return identity.parse::<EntryId>().map_err(invalid_params);
    }
    if let Some(reference) = get_str_param(params, "reference", "reference") {
        return Ok(EntryId::package(reference));
    }
    match (
        get_str_param(params, "save_path", "savePath"),
        get_str_param(params, "filename", "fileName"),
    ) {
        (Some(save_path), Some(filename)) => Ok(EntryId::model(save_path, filename)),
        _ => Err(invalid_params(
            "Missing required parameter: entry (or reference, or save_path and filename)",
        )),
    }
}

pub(crate) fn require_kind_param(params: &Value) -> Result<OperationKind> {
    let kind = require_str_param(params, "kind", "kind")?;
    OperationKind::from_str(&kind)
        .ok_or_else(|| invalid_params(format!("Unknown operation kind: {}", kind)))
}

pub(crate) fn invalid_params(message: impl Into<String>) -> ManagerError {
    ManagerError::InvalidParams {
        message: message.into(),
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = &request.method;
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id.clone();

    debug!("RPC call: {}({:?})", method, params);

    if method == "health_check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    let Some(result) = dispatch_method(&state, method, &params).await else {
        warn!("Method not found: {}", method);
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            )),
        );
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            (
                StatusCode::OK,
                Json(JsonRpcResponse::from_manager_error(id, &e)),
            )
        }
    }
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Route a method to its handler. `None` means the method does not exist.
async fn dispatch_method(state: &AppState, method: &str, params: &Value) -> Option<Result<Value>> {
    let result = match method {
        // Registry & local state
        "refresh_registry" => catalog::refresh_registry(state, params).await,
        "refresh_local_state" => catalog::refresh_local_state(state, params).await,

        // Catalog
        "get_catalog" => catalog::get_catalog(state, params).await,
        "classify_entry" => catalog::classify_entry(state, params).await,
        "get_installed" => catalog::get_installed(state, params).await,

        // Operations
        "install_entry" => operations::install_entry(state, params).await,
        "update_entry" => operations::update_entry(state, params).await,
        "uninstall_entry" => operations::uninstall_entry(state, params).await,
        "execute_batch" => operations::execute_batch(state, params).await,

        // Operation journal
        "get_operation_status" => operations::get_operation_status(state, params).await,
        "list_operations" => operations::list_operations(state, params).await,
        "cancel_operation" => operations::cancel_operation(state, params).await,

        _ => return None,
    };
    Some(result)
}

// ============================================================================
// Tests
// ============================================================================

//! Install, update and uninstall handlers plus the operation journal.
//!
//! A failed operation is still a successful call: the outcome carries
//! `status: "failure"` and the error detail, the same shape every coalesced
//! caller receives.

use super::{get_i64_param, get_str_param, invalid_params, require_entry_id, require_kind_param};
use crate::server::AppState;
use manager_core::{ExecuteOptions, OperationKind, OperationRequest, Result};
use serde_json::{json, Value};
use std::time::Duration;

pub async fn install_entry(state: &AppState, params: &Value) -> Result<Value> {
    run(state, OperationKind::Install, params).await
}

pub async fn update_entry(state: &AppState, params: &Value) -> Result<Value> {
    run(state, OperationKind::Update, params).await
}

pub async fn uninstall_entry(state: &AppState, params: &Value) -> Result<Value> {
    run(state, OperationKind::Uninstall, params).await
}

async fn run(state: &AppState, kind: OperationKind, params: &Value) -> Result<Value> {
    let entry = require_entry_id(params)?;
    let options = execute_options(params)?;
    let outcome = state.manager.execute_with(kind, entry, options).await;
    Ok(serde_json::to_value(outcome)?)
}

fn execute_options(params: &Value) -> Result<ExecuteOptions> {
    match get_i64_param(params, "deadline_ms", "deadlineMs") {
        None => Ok(ExecuteOptions::default()),
        Some(ms) if ms > 0 => Ok(ExecuteOptions::with_deadline(Duration::from_millis(
            ms as u64,
        ))),
        Some(ms) => Err(invalid_params(format!(
            "deadline_ms must be positive, got {}",
            ms
        ))),
    }
}

pub async fn execute_batch(state: &AppState, params: &Value) -> Result<Value> {
    let requests = params
        .get("requests")
        .cloned()
        .ok_or_else(|| invalid_params("Missing required parameter: requests"))?;
    let requests: Vec<OperationRequest> = serde_json::from_value(requests)
        .map_err(|e| invalid_params(format!("Invalid requests: {}", e)))?;
    let options = execute_options(params)?;
    let outcomes = state.manager.execute_batch_with(requests, options).await;
    Ok(json!({ "outcomes": serde_json::to_value(outcomes)? }))
}

/// Look up an operation by id, or the latest one for a `(kind, entry)` pair.
pub async fn get_operation_status(state: &AppState, params: &Value) -> Result<Value> {
    let record = match get_str_param(params, "operation_id", "operationId") {
        Some(operation_id) => state.manager.get_operation(operation_id),
        None => {
            let kind = require_kind_param(params)?;
            let entry = require_entry_id(params)?;
            state.manager.operation_status(kind, entry)
        }
    };
    Ok(serde_json::to_value(record)?)
}

pub async fn list_operations(state: &AppState, _params: &Value) -> Result<Value> {
    let records = state.manager.list_operations();
    Ok(json!({ "operations": serde_json::to_value(records)? }))
}

pub async fn cancel_operation(state: &AppState, params: &Value) -> Result<Value> {
    let cancelled = match get_str_param(params, "operation_id", "operationId") {
        Some(operation_id) => state.manager.cancel_operation(operation_id),
        None => {
            let kind = require_kind_param(params)?;
            let entry = require_entry_id(params)?;
            state.manager.cancel(kind, entry)
        }
    };
    Ok(json!({ "cancelled": cancelled }))
}

//! Registry, local state and catalog handlers.

use super::require_entry_id;
use crate::server::AppState;
use manager_core::Result;
use serde_json::{json, Value};

pub async fn refresh_registry(state: &AppState, _params: &Value) -> Result<Value> {
    let summary = state.manager.refresh_registry().await?;
    Ok(serde_json::to_value(summary)?)
}

pub async fn refresh_local_state(state: &AppState, _params: &Value) -> Result<Value> {
    let summary = state.manager.refresh_local_state().await?;
    Ok(serde_json::to_value(summary)?)
}

pub async fn get_catalog(state: &AppState, _params: &Value) -> Result<Value> {
    let view = state.manager.catalog().await?;
    Ok(serde_json::to_value(view)?)
}

pub async fn classify_entry(state: &AppState, params: &Value) -> Result<Value> {
    let entry = require_entry_id(params)?;
    let classification = state.manager.classify(&entry).await?;
    Ok(serde_json::to_value(classification)?)
}

/// Manifest records as last loaded, keyed by entry identity.
pub async fn get_installed(state: &AppState, _params: &Value) -> Result<Value> {
    let local = state.manager.local_state();
    Ok(json!({
        "records": serde_json::to_value(local.records())?,
        "recovered": serde_json::to_value(local.recovered())?,
    }))
}

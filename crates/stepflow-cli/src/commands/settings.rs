//! `stepflow settings`: engine-wide key/value settings.

use serde_json::json;
use stepflow_core::state::AppState;

use super::print_json;

pub async fn set(state: &AppState, key: &str, value: &str) -> Result<(), String> {
    state
        .settings_store
        .set(key, value)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "key": key, "value": value }));
    Ok(())
}

pub async fn get(state: &AppState, key: &str) -> Result<(), String> {
    let value = state
        .settings_store
        .get(key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Setting not found: {}", key))?;
    print_json(&json!({ "key": key, "value": value }));
    Ok(())
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let settings = state.settings_store.list().await.map_err(|e| e.to_string())?;
    let map: serde_json::Map<String, serde_json::Value> = settings
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    print_json(&serde_json::Value::Object(map));
    Ok(())
}

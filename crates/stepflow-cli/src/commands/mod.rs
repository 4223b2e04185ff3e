//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! stepflow-core engine through `AppState`.

pub mod job;
pub mod settings;
pub mod worker;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use stepflow_core::state::{AppState, AppStateInner};
use stepflow_core::{Database, EngineConfig};

/// `<data dir>/stepflow/stepflow.db`, falling back to `stepflow.db` in the
/// current directory.
pub fn default_db_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("stepflow").join("stepflow.db"))
        .unwrap_or_else(|| PathBuf::from("stepflow.db"))
        .to_string_lossy()
        .into_owned()
}

/// Open the database, load the engine config and publish the first
/// definition snapshot.
pub async fn init_state(db_path: &str, config_path: Option<&str>) -> Result<AppState, String> {
    let config = EngineConfig::load(config_path)?;
    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;
    let state: AppState = Arc::new(AppStateInner::new(db, config).map_err(|e| e.to_string())?);
    state
        .reload_definitions()
        .await
        .map_err(|e| format!("Failed to load definitions: {}", e))?;
    Ok(state)
}

/// Parse an optional JSON argument, defaulting to `{}`.
pub fn parse_json_arg(raw: Option<&str>) -> Result<serde_json::Value, String> {
    match raw {
        None => Ok(serde_json::json!({})),
        Some(s) => serde_json::from_str(s).map_err(|e| format!("Invalid JSON '{}': {}", s, e)),
    }
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialize and pretty-print anything serde can handle.
pub fn print_serialized<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
    print_json(&value);
    Ok(())
}

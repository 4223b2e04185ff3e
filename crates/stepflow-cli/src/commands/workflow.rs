//! `stepflow workflow`: load and inspect YAML definition bundles.

use std::path::Path;

use serde_json::json;
use stepflow_core::state::AppState;
use stepflow_core::workflow::{BundleSummary, WorkflowBundle};

use super::{print_json, print_serialized};

/// Apply every bundle matching `pattern` (a file, a directory or a glob),
/// then publish a fresh snapshot.
pub async fn load(state: &AppState, pattern: &str) -> Result<(), String> {
    let files = WorkflowBundle::discover(pattern)?;
    if files.is_empty() {
        return Err(format!("No workflow files match '{}'", pattern));
    }

    let mut total = BundleSummary::default();
    for file in &files {
        let path = file.to_string_lossy();
        let bundle = WorkflowBundle::from_file(&path)?;
        let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
        let summary = bundle
            .apply(&state.definition_store, base_dir)
            .await
            .map_err(|e| format!("{}: {}", path, e))?;
        println!(
            "Loaded {} ({} agents, {} modules, {} workflows)",
            path, summary.agents, summary.modules, summary.workflows
        );
        total.agents += summary.agents;
        total.modules += summary.modules;
        total.workflows += summary.workflows;
    }

    let snapshot = state.reload_definitions().await.map_err(|e| e.to_string())?;
    print_json(&json!({
        "files": files.len(),
        "agents": total.agents,
        "modules": total.modules,
        "workflows": total.workflows,
        "loadedWorkflows": snapshot.workflow_count(),
    }));
    Ok(())
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let defs = &state.definition_store;
    let agents = defs.list_agents().await.map_err(|e| e.to_string())?;
    let modules = defs.list_modules().await.map_err(|e| e.to_string())?;
    let workflows = defs.list_workflows().await.map_err(|e| e.to_string())?;
    print_serialized(&json!({
        "agents": agents,
        "modules": modules,
        "workflows": workflows,
    }))
}

/// Parse and check a bundle file without touching the database.
pub fn validate(file: &str) -> Result<(), String> {
    let bundle = WorkflowBundle::from_file(file)?;
    bundle.validate()?;
    println!(
        "Valid: {} agents, {} modules, {} workflows",
        bundle.agents.len(),
        bundle.modules.len(),
        bundle.workflows.len()
    );
    Ok(())
}

pub async fn delete(state: &AppState, id: &str) -> Result<(), String> {
    if !state
        .definition_store
        .delete_workflow(id)
        .await
        .map_err(|e| e.to_string())?
    {
        return Err(format!("Workflow not found: {}", id));
    }
    state.reload_definitions().await.map_err(|e| e.to_string())?;
    print_json(&json!({ "deleted": id }));
    Ok(())
}

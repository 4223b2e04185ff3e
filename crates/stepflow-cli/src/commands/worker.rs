//! `stepflow worker`: run the worker pool until interrupted.

use stepflow_core::state::AppState;

pub async fn run(state: &AppState, workers: Option<usize>) -> Result<(), String> {
    let workers = workers.unwrap_or(state.config.workers);
    let snapshot = state.registry.snapshot();
    println!(
        "Starting {} workers ({} workflows loaded)...",
        workers,
        snapshot.workflow_count()
    );

    let handle = state.worker_pool().start(workers);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down, waiting for running jobs...");
    handle.shutdown().await;
    Ok(())
}

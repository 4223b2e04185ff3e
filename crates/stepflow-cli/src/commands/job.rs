//! `stepflow job`: submit, inspect and manage jobs.

use std::time::Duration;

use serde_json::json;
use stepflow_core::models::JobStatus;
use stepflow_core::state::AppState;

use super::{parse_json_arg, print_json, print_serialized};

const WAIT_POLL: Duration = Duration::from_millis(500);

/// Submit a job. `sync` runs it in this process; otherwise it is queued for
/// a worker and, with `wait`, polled until terminal.
pub async fn submit(
    state: &AppState,
    workflow: &str,
    input: Option<&str>,
    working_directory: Option<String>,
    sync: bool,
    wait: bool,
) -> Result<(), String> {
    let input = parse_json_arg(input)?;
    let executor = &state.executor;

    let job = if sync {
        executor
            .submit_sync(workflow, input, working_directory)
            .await
            .map_err(|e| e.to_string())?
    } else {
        let job = executor
            .submit_async(workflow, input, working_directory)
            .await
            .map_err(|e| e.to_string())?;
        if !wait {
            print_json(&json!({
                "job_id": job.id,
                "status": job.status.as_str(),
                "message": stepflow_core::workflow::executor::ASYNC_SUBMITTED_MESSAGE,
            }));
            return Ok(());
        }
        executor
            .wait_for_job(&job.id, WAIT_POLL, None)
            .await
            .map_err(|e| e.to_string())?
    };

    print_serialized(&job)?;
    match job.status {
        JobStatus::Completed => Ok(()),
        _ => Err(format!(
            "Job {} {}: {}",
            job.id,
            job.status,
            job.error_message.unwrap_or_default()
        )),
    }
}

pub async fn get(state: &AppState, id: &str) -> Result<(), String> {
    let job = state
        .job_store
        .get(id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Job not found: {}", id))?;
    print_serialized(&job)
}

pub async fn list(state: &AppState, status: Option<&str>) -> Result<(), String> {
    let status = match status {
        Some(s) => Some(JobStatus::from_str(s).ok_or_else(|| format!("Unknown job status: {}", s))?),
        None => None,
    };
    let jobs = state.job_store.list(status).await.map_err(|e| e.to_string())?;
    print_serialized(&jobs)
}

pub async fn steps(state: &AppState, id: &str) -> Result<(), String> {
    let steps = state.job_store.list_steps(id).await.map_err(|e| e.to_string())?;
    print_serialized(&steps)
}

pub async fn delete(state: &AppState, id: &str) -> Result<(), String> {
    if state.job_store.delete(id).await.map_err(|e| e.to_string())? {
        print_json(&json!({ "deleted": id }));
        Ok(())
    } else {
        Err(format!("Job not found: {}", id))
    }
}

pub async fn cancel(state: &AppState, id: &str) -> Result<(), String> {
    let job = state.executor.cancel(id).await.map_err(|e| e.to_string())?;
    print_serialized(&job)
}

pub async fn wait(state: &AppState, id: &str, timeout_secs: Option<u64>) -> Result<(), String> {
    let job = state
        .executor
        .wait_for_job(id, WAIT_POLL, timeout_secs.map(Duration::from_secs))
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&job)
}

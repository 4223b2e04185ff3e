//! Integration tests for the stepflow-cli commands.
//!
//! These tests verify that the CLI commands work correctly by
//! exercising the same code paths as the binary, using temporary
//! SQLite databases for isolation.

use serde_json::json;
use stepflow_cli::commands;
use stepflow_core::models::JobStatus;
use stepflow_core::state::AppState;

const BUNDLE: &str = r#"
agents:
  - id: echo
    name: Echo
    provider: echo

modules:
  - id: noop
    path: noop.wat

workflows:
  - id: greet
    name: Greeting
    steps:
      - type: agent
        agent: echo
  - id: quiet
    steps:
      - type: wasm
        module: noop
"#;

const NOOP_MODULE: &str = r#"(module (memory (export "memory") 1) (func (export "_start")))"#;

/// A fresh database with the test bundle loaded.
async fn loaded_state(dir: &tempfile::TempDir) -> AppState {
    std::fs::write(dir.path().join("bundle.yaml"), BUNDLE).unwrap();
    std::fs::write(dir.path().join("noop.wat"), NOOP_MODULE).unwrap();
    let db = dir.path().join("stepflow.db");
    let state = commands::init_state(&db.to_string_lossy(), None)
        .await
        .expect("Failed to initialize state");
    commands::workflow::load(&state, &dir.path().to_string_lossy())
        .await
        .expect("Failed to load bundle");
    state
}

#[tokio::test]
async fn test_workflow_load_publishes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;

    let snapshot = state.registry.snapshot();
    assert_eq!(snapshot.workflow_count(), 2);
    assert!(snapshot.workflow("Greeting").is_some());
    assert!(snapshot.has_module("noop"));
    commands::workflow::list(&state).await.unwrap();
}

#[tokio::test]
async fn test_workflow_load_rejects_empty_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;
    let missing = dir.path().join("nothing-*.yaml");
    let err = commands::workflow::load(&state, &missing.to_string_lossy())
        .await
        .unwrap_err();
    assert!(err.contains("match"), "{}", err);
}

#[test]
fn test_workflow_validate_reports_unknown_references() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("broken.yaml");
    std::fs::write(
        &file,
        "workflows:\n  - id: broken\n    steps:\n      - type: agent\n        agent: ghost\n",
    )
    .unwrap();
    let err = commands::workflow::validate(&file.to_string_lossy()).unwrap_err();
    assert!(err.contains("ghost"), "{}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_submit_sync_completes() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;

    commands::job::submit(&state, "greet", Some(r#"{"prompt":"hello"}"#), None, true, false)
        .await
        .unwrap();

    let jobs = state.job_store.list(None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].output, Some(json!({"message": "hello"})));

    commands::job::steps(&state, &jobs[0].id).await.unwrap();
    commands::job::get(&state, &jobs[0].id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_submit_sync_runs_module() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;

    commands::job::submit(&state, "quiet", None, None, true, false)
        .await
        .unwrap();
    let jobs = state.job_store.list(Some(JobStatus::Completed)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].output, Some(json!({})));
}

#[tokio::test]
async fn test_job_submit_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;
    let err = commands::job::submit(&state, "greet", Some("{not json"), None, false, false)
        .await
        .unwrap_err();
    assert!(err.contains("Invalid JSON"));
    assert!(state.job_store.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_queue_cancel_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;

    commands::job::submit(&state, "greet", None, None, false, false)
        .await
        .unwrap();
    let queued = state.job_store.list(Some(JobStatus::Queued)).await.unwrap();
    assert_eq!(queued.len(), 1);
    let id = queued[0].id.clone();

    commands::job::cancel(&state, &id).await.unwrap();
    let job = state.job_store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(commands::job::cancel(&state, &id).await.is_err());

    commands::job::delete(&state, &id).await.unwrap();
    assert!(state.job_store.get(&id).await.unwrap().is_none());
    assert!(commands::job::delete(&state, &id).await.is_err());
}

#[tokio::test]
async fn test_job_list_rejects_unknown_status() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;
    let err = commands::job::list(&state, Some("paused")).await.unwrap_err();
    assert!(err.contains("paused"));
}

#[tokio::test]
async fn test_settings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state = loaded_state(&dir).await;

    commands::settings::set(&state, "timeout_job_seconds", "90").await.unwrap();
    commands::settings::get(&state, "timeout_job_seconds").await.unwrap();
    assert_eq!(state.settings_store.job_timeout_secs().await.unwrap(), Some(90));
    assert!(commands::settings::get(&state, "missing").await.is_err());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let state = loaded_state(&dir).await;
        commands::job::submit(&state, "greet", None, None, false, false)
            .await
            .unwrap();
    }
    let db = dir.path().join("stepflow.db");
    let state = commands::init_state(&db.to_string_lossy(), None).await.unwrap();
    assert_eq!(state.registry.snapshot().workflow_count(), 2);
    assert_eq!(state.job_store.list(Some(JobStatus::Queued)).await.unwrap().len(), 1);
}

//! End-to-end tests: definitions → executor → sandbox → host bridge → stores.
//!
//! Guests are written in WAT; wasmtime compiles the text form directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use stepflow_core::agent::Agent;
use stepflow_core::models::{AgentDef, JobStatus, ModuleDef, StepStatus, StepType, Workflow, WorkflowStep};
use stepflow_core::store::settings_store::JOB_TIMEOUT_KEY;
use stepflow_core::workflow::executor::ASYNC_SUBMITTED_MESSAGE;
use stepflow_core::{AppStateInner, Database, EngineConfig, ServerError};

const UPPER_PROMPT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (local $n i32) (local $i i32) (local $quotes i32) (local $start i32) (local $end i32) (local $c i32)
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (i32.const 4096))
    (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
    (local.set $n (i32.load (i32.const 8)))
    ;; the value of a single-key object sits between the 3rd and 4th quote
    (block $done
      (loop $scan
        (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
        (local.set $c (i32.load8_u (i32.add (i32.const 1024) (local.get $i))))
        (if (i32.eq (local.get $c) (i32.const 34))
          (then
            (local.set $quotes (i32.add (local.get $quotes) (i32.const 1)))
            (if (i32.eq (local.get $quotes) (i32.const 3))
              (then (local.set $start (i32.add (local.get $i) (i32.const 1)))))
            (if (i32.eq (local.get $quotes) (i32.const 4))
              (then (local.set $end (local.get $i)) (br $done)))))
        (if (i32.and
              (i32.ge_u (local.get $quotes) (i32.const 3))
              (i32.and (i32.ge_u (local.get $c) (i32.const 97)) (i32.le_u (local.get $c) (i32.const 122))))
          (then
            (i32.store8 (i32.add (i32.const 1024) (local.get $i)) (i32.sub (local.get $c) (i32.const 32)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $scan)))
    (i32.store (i32.const 16) (i32.add (i32.const 1024) (local.get $start)))
    (i32.store (i32.const 20) (i32.sub (local.get $end) (local.get $start)))
    (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))))
"#;

const PRINT_WORKING_DIRECTORY: &str = r#"
(module
  (import "env" "get_working_directory" (func $get_wd (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (local $len i32)
    (local.set $len (call $get_wd (i32.const 0) (i32.const 0)))
    (drop (call $get_wd (i32.const 1024) (local.get $len)))
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (local.get $len))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

const SET_WORKING_DIRECTORY: &str = r#"
(module
  (import "env" "set_working_directory" (func $set_wd (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "sub")
  (func (export "_start")
    (if (i32.ne (call $set_wd (i32.const 16) (i32.const 3)) (i32.const 0))
      (then (call $exit (i32.const 1))))))
"#;

const EXIT_THREE: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))
"#;

const SPIN: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (loop $forever (br $forever))))
"#;

/// Guest that triggers `kind`/`target` with `params` and prints the
/// operation result. Exits with 2 when the trigger is rejected.
fn trigger_guest(kind: &str, target: &str, params: &str) -> String {
    format!(
        r#"
(module
  (import "env" "trigger_workflow_or_agent" (func $trigger (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "env" "get_last_operation_result" (func $result (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 100) "{kind}")
  (data (i32.const 200) "{target}")
  (data (i32.const 300) "{params}")
  (func (export "_start")
    (local $len i32)
    (if (i32.ne
          (call $trigger (i32.const 100) (i32.const {kind_len}) (i32.const 200) (i32.const {target_len})
                         (i32.const 300) (i32.const {params_len}))
          (i32.const 0))
      (then (call $exit (i32.const 2))))
    (local.set $len (call $result (i32.const 0) (i32.const 0)))
    (drop (call $result (i32.const 1024) (local.get $len)))
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (local.get $len))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#,
        kind = kind,
        target = target,
        params = params.replace('"', "\\\""),
        kind_len = kind.len(),
        target_len = target.len(),
        params_len = params.len(),
    )
}

struct FailingAgent;

#[async_trait]
impl Agent for FailingAgent {
    async fn invoke(&self, agent: &AgentDef, _system_prompt: &str, _input: &Value) -> Result<Value, ServerError> {
        Err(ServerError::Agent(format!("{} is unavailable", agent.name)))
    }
}

/// Completes its step after dropping the step table, so recording the
/// step's result fails.
struct TableDroppingAgent {
    db: Database,
}

#[async_trait]
impl Agent for TableDroppingAgent {
    async fn invoke(&self, _agent: &AgentDef, _system_prompt: &str, _input: &Value) -> Result<Value, ServerError> {
        self.db
            .with_conn_async(|conn| conn.execute_batch("DROP TABLE job_steps"))
            .await?;
        Ok(json!({"message": "done"}))
    }
}

fn engine(config: EngineConfig) -> AppStateInner {
    AppStateInner::new(Database::open_in_memory().unwrap(), config).unwrap()
}

fn workflow(id: &str, steps: &[(StepType, &str)]) -> Workflow {
    let mut wf = Workflow::new(id.to_string(), id.to_string(), None);
    wf.steps = steps
        .iter()
        .enumerate()
        .map(|(i, (step_type, target))| {
            let order = i as i64 + 1;
            WorkflowStep {
                id: format!("{}-step-{}", id, order),
                workflow_id: id.to_string(),
                step_order: order,
                step_type: *step_type,
                agent_id: (*step_type == StepType::Agent).then(|| target.to_string()),
                module_id: (*step_type == StepType::Wasm).then(|| target.to_string()),
                config: json!({}),
            }
        })
        .collect();
    wf
}

async fn seed(state: &AppStateInner, modules: &[(&str, &str)], workflows: &[Workflow]) {
    let defs = &state.definition_store;
    defs.save_agent(&AgentDef::new("echo".into(), "Echo".into(), "echo".into()))
        .await
        .unwrap();
    for (id, wat) in modules {
        defs.save_module(&ModuleDef::new(id.to_string(), id.to_string(), wat.as_bytes().to_vec(), json!({})))
            .await
            .unwrap();
    }
    for wf in workflows {
        defs.save_workflow(wf).await.unwrap();
    }
    state.reload_definitions().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uppercase_module_then_echo_agent() {
    let state = engine(EngineConfig::default());
    seed(
        &state,
        &[("upper", UPPER_PROMPT)],
        &[workflow("shout", &[(StepType::Wasm, "upper"), (StepType::Agent, "echo")])],
    )
    .await;

    let job = state
        .executor
        .submit_sync("shout", json!({"prompt": "hi"}), None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(json!({"message": "HI"})));

    let steps = state.job_store.list_steps(&job.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].output, Some(json!({"message": "HI"})));
    assert_eq!(steps[1].input, json!({"prompt": "HI"}));
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_step_stops_the_job() {
    let state = AppStateInner::with_agent(
        Database::open_in_memory().unwrap(),
        EngineConfig::default(),
        Arc::new(FailingAgent),
    )
    .unwrap();
    seed(
        &state,
        &[("upper", UPPER_PROMPT)],
        &[workflow("doomed", &[(StepType::Agent, "echo"), (StepType::Wasm, "upper")])],
    )
    .await;

    let job = state
        .executor
        .submit_sync("doomed", json!({"prompt": "hi"}), None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.starts_with("step 1 failed"), "{}", message);
    assert!(message.contains("Echo is unavailable"));

    let steps = state.job_store.list_steps(&job.id).await.unwrap();
    assert_eq!(steps.len(), 1, "no step may start after a failure");
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_middle_step_skips_the_rest() {
    let state = engine(EngineConfig::default());
    seed(
        &state,
        &[("exit3", EXIT_THREE)],
        &[workflow(
            "middle",
            &[(StepType::Agent, "echo"), (StepType::Wasm, "exit3"), (StepType::Agent, "echo")],
        )],
    )
    .await;

    let job = state
        .executor
        .submit_sync("middle", json!({"prompt": "hi"}), None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.starts_with("step 2 failed"), "{}", message);
    assert!(message.contains("exited with code 3"));

    let steps = state.job_store.list_steps(&job.id).await.unwrap();
    let statuses: Vec<_> = steps.iter().map(|s| (s.step_order, s.status)).collect();
    assert_eq!(statuses, vec![(1, StepStatus::Completed), (2, StepStatus::Failed)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_error_mid_job_still_fails_the_job() {
    let db = Database::open_in_memory().unwrap();
    let state = AppStateInner::with_agent(
        db.clone(),
        EngineConfig::default(),
        Arc::new(TableDroppingAgent { db }),
    )
    .unwrap();
    seed(&state, &[], &[workflow("fragile", &[(StepType::Agent, "echo")])]).await;

    let err = state
        .executor
        .submit_sync("fragile", json!({"prompt": "hi"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Database(_)), "{:?}", err);

    let jobs = state.job_store.list(None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error_message.as_deref().unwrap().contains("job_steps"));
    assert!(state.job_store.delete(&jobs[0].id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonzero_exit_fails_step() {
    let state = engine(EngineConfig::default());
    seed(&state, &[("exit3", EXIT_THREE)], &[workflow("quit", &[(StepType::Wasm, "exit3")])]).await;

    let job = state.executor.submit_sync("quit", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("exited with code 3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sandbox_wall_clock_limit() {
    let mut config = EngineConfig::default();
    config.sandbox.timeout_ms = 200;
    config.sandbox.fuel = u64::MAX;
    let state = engine(config);
    seed(&state, &[("spin", SPIN)], &[workflow("spin", &[(StepType::Wasm, "spin")])]).await;

    let job = state.executor.submit_sync("spin", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("sandbox timed out after 200ms"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sandbox_instruction_budget() {
    let mut config = EngineConfig::default();
    config.sandbox.fuel = 10_000;
    let state = engine(config);
    seed(&state, &[("spin", SPIN)], &[workflow("spin", &[(StepType::Wasm, "spin")])]).await;

    let job = state.executor.submit_sync("spin", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("instruction budget"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_timeout_setting_bounds_the_job() {
    let mut config = EngineConfig::default();
    config.sandbox.fuel = u64::MAX;
    let state = engine(config);
    seed(&state, &[("spin", SPIN)], &[workflow("spin", &[(StepType::Wasm, "spin")])]).await;
    state.settings_store.set(JOB_TIMEOUT_KEY, "1").await.unwrap();

    let job = state.executor.submit_sync("spin", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_jobs_see_their_own_working_directory() {
    let state = engine(EngineConfig::default());
    seed(&state, &[("pwd", PRINT_WORKING_DIRECTORY)], &[workflow("pwd", &[(StepType::Wasm, "pwd")])]).await;

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let dir_a = a.path().to_string_lossy().into_owned();
    let dir_b = b.path().to_string_lossy().into_owned();

    let (job_a, job_b) = tokio::join!(
        state.executor.submit_sync("pwd", json!({}), Some(dir_a.clone())),
        state.executor.submit_sync("pwd", json!({}), Some(dir_b.clone())),
    );
    assert_eq!(job_a.unwrap().output, Some(json!({"message": dir_a})));
    assert_eq!(job_b.unwrap().output, Some(json!({"message": dir_b})));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_step_may_change_working_directory() {
    let state = engine(EngineConfig::default());
    seed(
        &state,
        &[("cd", SET_WORKING_DIRECTORY), ("pwd", PRINT_WORKING_DIRECTORY)],
        &[workflow("cd", &[(StepType::Wasm, "cd"), (StepType::Wasm, "pwd")])],
    )
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().to_string_lossy().into_owned();

    let job = state
        .executor
        .submit_sync("cd", json!({}), Some(base.clone()))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let expected = tmp.path().join("sub").to_string_lossy().into_owned();
    assert!(tmp.path().join("sub").is_dir());
    assert_eq!(job.working_directory.as_deref(), Some(expected.as_str()));
    assert_eq!(job.output, Some(json!({"message": expected})));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_later_step_cannot_change_working_directory() {
    let state = engine(EngineConfig::default());
    seed(
        &state,
        &[("cd", SET_WORKING_DIRECTORY)],
        &[workflow("late-cd", &[(StepType::Agent, "echo"), (StepType::Wasm, "cd")])],
    )
    .await;
    let tmp = tempfile::tempdir().unwrap();

    let job = state
        .executor
        .submit_sync("late-cd", json!({"prompt": "x"}), Some(tmp.path().to_string_lossy().into_owned()))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("step 2 failed"));
    assert!(!tmp.path().join("sub").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_triggers_agent() {
    let state = engine(EngineConfig::default());
    let guest = trigger_guest("agent", "echo", r#"{"prompt":"nested"}"#);
    seed(&state, &[("ask", guest.as_str())], &[workflow("ask", &[(StepType::Wasm, "ask")])]).await;

    let job = state.executor.submit_sync("ask", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.output, Some(json!({"message": "nested"})));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_triggers_workflow_inline() {
    let state = engine(EngineConfig::default());
    let guest = trigger_guest("workflow", "shout", r#"{"prompt":"hi"}"#);
    seed(
        &state,
        &[("upper", UPPER_PROMPT), ("call", guest.as_str())],
        &[
            workflow("shout", &[(StepType::Wasm, "upper")]),
            workflow("outer", &[(StepType::Wasm, "call")]),
        ],
    )
    .await;

    let job = state.executor.submit_sync("outer", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.output, Some(json!({"message": "HI"})));

    let jobs = state.job_store.list(None).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_triggering_workflow_stops_at_depth_limit() {
    let mut config = EngineConfig::default();
    config.max_nesting_depth = 2;
    let state = engine(config);
    let guest = trigger_guest("workflow", "again", "{}");
    seed(&state, &[("recurse", guest.as_str())], &[workflow("again", &[(StepType::Wasm, "recurse")])]).await;

    let job = tokio::time::timeout(
        Duration::from_secs(30),
        state.executor.submit_sync("again", json!({}), None),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("exited with code 2"));

    let jobs = state.job_store.list(None).await.unwrap();
    assert_eq!(jobs.len(), 3, "top level plus two nested levels");
    assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_enqueues_workflow_asynchronously() {
    let state = engine(EngineConfig::default());
    let guest = trigger_guest("workflow", "greet", r#"{"async":true,"prompt":"later"}"#);
    seed(
        &state,
        &[("enqueue", guest.as_str())],
        &[
            workflow("greet", &[(StepType::Agent, "echo")]),
            workflow("outer", &[(StepType::Wasm, "enqueue")]),
        ],
    )
    .await;

    let job = state.executor.submit_sync("outer", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    let output = job.output.unwrap();
    assert_eq!(output["status"], "queued");
    assert_eq!(output["message"], ASYNC_SUBMITTED_MESSAGE);

    let nested_id = output["job_id"].as_str().unwrap();
    let nested = state.job_store.get(nested_id).await.unwrap().unwrap();
    assert_eq!(nested.status, JobStatus::Queued);
    assert_eq!(nested.input, json!({"prompt": "later"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_trigger_target_fails_guest() {
    let state = engine(EngineConfig::default());
    let guest = trigger_guest("agent", "nobody", "{}");
    seed(&state, &[("ask", guest.as_str())], &[workflow("ask", &[(StepType::Wasm, "ask")])]).await;

    let job = state.executor.submit_sync("ask", json!({}), None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("exited with code 2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_pool_runs_each_job_once() {
    let mut config = EngineConfig::default();
    config.poll_interval_ms = 10;
    config.max_idle_backoff_ms = 50;
    let state = engine(config);
    seed(
        &state,
        &[("upper", UPPER_PROMPT)],
        &[workflow("shout", &[(StepType::Wasm, "upper"), (StepType::Agent, "echo")])],
    )
    .await;

    let mut ids = Vec::new();
    for word in ["a", "b", "c", "d", "e"] {
        let job = state
            .executor
            .submit_async("shout", json!({"prompt": word}), None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        ids.push((job.id, word.to_uppercase()));
    }

    let handle = state.worker_pool().start(3);
    for (id, expected) in &ids {
        let job = state
            .executor
            .wait_for_job(id, Duration::from_millis(20), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"message": expected})));
        assert_eq!(state.job_store.list_steps(id).await.unwrap().len(), 2);
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn test_cancel_only_before_start() {
    let state = engine(EngineConfig::default());
    seed(&state, &[], &[workflow("greet", &[(StepType::Agent, "echo")])]).await;

    let queued = state.executor.submit_async("greet", json!({}), None).await.unwrap();
    let cancelled = state.executor.cancel(&queued.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some("cancelled before start"));

    let err = state.executor.cancel(&queued.id).await.unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
    assert!(state.job_store.claim().await.unwrap().is_none());
}

#[tokio::test]
async fn test_submit_unknown_workflow() {
    let state = engine(EngineConfig::default());
    let err = state
        .executor
        .submit_async("missing", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

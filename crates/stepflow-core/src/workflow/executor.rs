//! Executor: runs a claimed job's steps in order.
//!
//! ```text
//!  claimed job ──► plan (registry snapshot)
//!                    │
//!                    ▼
//!   for each step:  create PENDING ──► RUNNING ──► execute ──► COMPLETED ─┐
//!                                                     │                     │
//!                                                     └─► FAILED ─► job FAILED
//!                                                                           │
//!   output carried forward (message → prompt) ◄─────────────────────────────┘
//! ```
//!
//! The first failing step fails the job; later steps are never created.
//! Every job runs under a deadline; nested jobs share their parent's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use super::io;
use super::step::{StepContext, WorkflowPlan};
use crate::agent::{input_from_params, Agent};
use crate::config::EngineConfig;
use crate::error::ServerError;
use crate::models::job::{Job, JobStatus};
use crate::registry::Registry;
use crate::sandbox::{Invocation, NestedCall, NestedRunner, SandboxRuntime, TargetKind};
use crate::store::{JobStore, SettingsStore};

pub const ASYNC_SUBMITTED_MESSAGE: &str = "Workflow job submitted successfully";

#[derive(Clone)]
pub struct Executor {
    jobs: JobStore,
    settings: SettingsStore,
    registry: Arc<Registry>,
    sandbox: Arc<SandboxRuntime>,
    agent: Arc<dyn Agent>,
    config: Arc<EngineConfig>,
}

/// Deadline of one job, with the budget it was derived from for messages.
#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Executor {
    pub fn new(
        jobs: JobStore,
        settings: SettingsStore,
        registry: Arc<Registry>,
        sandbox: Arc<SandboxRuntime>,
        agent: Arc<dyn Agent>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            jobs,
            settings,
            registry,
            sandbox,
            agent,
            config,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Enqueue a job for the worker pool and return it immediately.
    pub async fn submit_async(
        &self,
        workflow: &str,
        input: Value,
        working_directory: Option<String>,
    ) -> Result<Job, ServerError> {
        let plan = self.require_plan(workflow).await?;
        self.jobs.create(&plan.id, input, working_directory).await
    }

    /// Run a job on the calling task and return it once terminal. The job
    /// is claimed at creation, so no worker can pick it up.
    pub async fn submit_sync(
        &self,
        workflow: &str,
        input: Value,
        working_directory: Option<String>,
    ) -> Result<Job, ServerError> {
        let plan = self.require_plan(workflow).await?;
        let job = self.jobs.create_claimed(&plan.id, input, working_directory).await?;
        tracing::info!("[Executor] Running job {} inline", job.id);
        let deadline = self.deadline().await;
        self.run_job(job, 0, deadline).await
    }

    /// Execute a job a worker has claimed.
    pub async fn run_claimed(&self, job: Job) -> Result<Job, ServerError> {
        let deadline = self.deadline().await;
        self.run_job(job, 0, deadline).await
    }

    /// Fail a job that has not started yet.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, ServerError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Queued {
            return Err(ServerError::Conflict(format!(
                "job {} is {} and can no longer be cancelled",
                job_id, job.status
            )));
        }
        self.jobs
            .update_status(job_id, JobStatus::Failed, None, Some("cancelled before start".to_string()))
            .await
    }

    /// Poll until the job is terminal.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        poll: Duration,
        timeout: Option<Duration>,
    ) -> Result<Job, ServerError> {
        let started = Instant::now();
        loop {
            let job = self
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| ServerError::NotFound(format!("job {}", job_id)))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(ServerError::Timeout(format!(
                        "job {} still {} after {:?}",
                        job_id, job.status, limit
                    )));
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn deadline(&self) -> Deadline {
        let secs = match self.settings.job_timeout_secs().await {
            Ok(Some(secs)) => secs,
            Ok(None) => self.config.job_timeout_secs,
            Err(e) => {
                tracing::warn!("[Executor] Could not read job timeout setting: {}", e);
                self.config.job_timeout_secs
            }
        };
        let budget = Duration::from_secs(secs);
        Deadline {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Resolve a workflow by id or name, reloading the registry once when
    /// the current snapshot does not know it.
    async fn plan(&self, key: &str) -> Result<Option<Arc<WorkflowPlan>>, ServerError> {
        if let Some(plan) = self.registry.snapshot().workflow(key) {
            return Ok(Some(plan));
        }
        tracing::debug!("[Executor] Workflow '{}' not in snapshot, reloading", key);
        Ok(self.registry.reload().await?.workflow(key))
    }

    async fn require_plan(&self, key: &str) -> Result<Arc<WorkflowPlan>, ServerError> {
        let plan = self
            .plan(key)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("workflow '{}'", key)))?;
        match &plan.error {
            Some(reason) => Err(ServerError::BadRequest(format!(
                "workflow '{}' cannot run: {}",
                plan.name, reason
            ))),
            None => Ok(plan),
        }
    }

    async fn fail_job(&self, job_id: &str, message: String) -> Result<Job, ServerError> {
        tracing::warn!("[Executor] Job {} failed: {}", job_id, message);
        self.jobs
            .update_status(job_id, JobStatus::Failed, None, Some(message))
            .await
    }

    /// Run a claimed job to a terminal status. A store error mid-run still
    /// moves the job out of `running` when the store allows it.
    async fn run_job(&self, job: Job, depth: u32, deadline: Deadline) -> Result<Job, ServerError> {
        let job_id = job.id.clone();
        match self.run_steps(job, depth, deadline).await {
            Ok(done) => Ok(done),
            Err(e) => {
                tracing::error!("[Executor] Job {} aborted: {}", job_id, e);
                if let Err(fail_err) = self.fail_job(&job_id, e.to_string()).await {
                    tracing::error!("[Executor] Could not mark job {} failed: {}", job_id, fail_err);
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&self, job: Job, depth: u32, deadline: Deadline) -> Result<Job, ServerError> {
        let plan = match self.plan(&job.workflow_id).await? {
            Some(plan) if plan.is_runnable() => plan,
            Some(plan) => {
                let reason = plan.error.clone().unwrap_or_default();
                return self
                    .fail_job(&job.id, format!("workflow '{}' cannot run: {}", plan.name, reason))
                    .await;
            }
            None => {
                return self
                    .fail_job(&job.id, format!("workflow '{}' not found", job.workflow_id))
                    .await;
            }
        };

        tracing::info!(
            "[Executor] Job {} running workflow '{}' ({} steps, depth {})",
            job.id,
            plan.name,
            plan.steps.len(),
            depth
        );

        let mut carried = match job.input {
            Value::Null => Value::Object(Map::new()),
            input => input,
        };
        let mut working_directory = job.working_directory.clone();
        let mut last_output = Value::Object(Map::new());

        for (index, step) in plan.steps.iter().enumerate() {
            let input = step.prepare_input(&carried);
            let record = self
                .jobs
                .create_step(&job.id, &step.id, step.order, input.clone())
                .await?;
            self.jobs.start_step(&record.id).await?;
            tracing::info!(
                "[Executor] Job {} step {} ({}) started",
                job.id,
                step.order,
                step.type_name()
            );

            let ctx = StepContext {
                agent: self.agent.as_ref(),
                sandbox: self.sandbox.as_ref(),
                invocation: Invocation {
                    job_id: job.id.clone(),
                    working_directory: working_directory.clone(),
                    first_step: index == 0,
                    depth,
                    deadline: deadline.at.into_std(),
                    nested: Arc::new(self.clone()),
                },
            };

            let outcome = tokio::time::timeout_at(deadline.at, step.execute(ctx, &input)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    let message = format!("job timed out after {} seconds", deadline.budget.as_secs());
                    self.jobs.fail_step(&record.id, &message).await?;
                    return self.fail_job(&job.id, message).await;
                }
            };

            match result {
                Ok(out) => {
                    self.jobs.complete_step(&record.id, &out.output).await?;
                    if let Some(dir) = out.working_directory {
                        self.jobs.set_working_directory(&job.id, &dir).await?;
                        working_directory = Some(dir);
                    }
                    tracing::info!("[Executor] Job {} step {} completed", job.id, step.order);
                    carried = io::carry_forward(out.output.clone());
                    last_output = out.output;
                }
                Err(e) if Instant::now() >= deadline.at => {
                    tracing::debug!("[Executor] Step {} hit the job deadline: {}", step.order, e);
                    let message = format!("job timed out after {} seconds", deadline.budget.as_secs());
                    self.jobs.fail_step(&record.id, &message).await?;
                    return self.fail_job(&job.id, message).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.jobs.fail_step(&record.id, &message).await?;
                    return self
                        .fail_job(&job.id, format!("step {} failed: {}", step.order, message))
                        .await;
                }
            }
        }

        let done = self
            .jobs
            .update_status(&job.id, JobStatus::Completed, Some(last_output), None)
            .await?;
        tracing::info!("[Executor] Job {} completed", done.id);
        Ok(done)
    }

    async fn run_nested_agent(&self, call: NestedCall) -> Result<Value, ServerError> {
        let agent = match self.registry.snapshot().agent(&call.target) {
            Some(agent) => agent,
            None => self
                .registry
                .reload()
                .await?
                .agent(&call.target)
                .ok_or_else(|| ServerError::NotFound(format!("agent '{}'", call.target)))?,
        };
        let input = input_from_params(&call.params);
        let deadline = Instant::from_std(call.deadline);
        let output = tokio::time::timeout_at(
            deadline,
            self.agent.invoke(&agent, &agent.system_prompt, &input),
        )
        .await
        .map_err(|_| ServerError::Timeout(format!("agent '{}' passed the job deadline", agent.name)))??;
        Ok(io::as_output(output))
    }

    async fn run_nested_workflow(&self, call: NestedCall) -> Result<Value, ServerError> {
        let mut params = match call.params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let run_async = params
            .remove("async")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let working_directory = params
            .remove("working_directory")
            .and_then(|v| v.as_str().map(String::from))
            .or(call.working_directory);
        let input = Value::Object(params);

        if run_async {
            let job = self.submit_async(&call.target, input, working_directory).await?;
            tracing::info!(
                "[Executor] Job {} enqueued nested job {}",
                call.caller_job_id,
                job.id
            );
            return Ok(json!({
                "job_id": job.id,
                "status": job.status.as_str(),
                "message": ASYNC_SUBMITTED_MESSAGE,
            }));
        }

        if call.depth > self.config.max_nesting_depth {
            return Err(ServerError::BadRequest(format!(
                "nesting depth {} exceeds the limit of {}",
                call.depth, self.config.max_nesting_depth
            )));
        }

        let plan = self.require_plan(&call.target).await?;
        let job = self
            .jobs
            .create_claimed(&plan.id, input, working_directory)
            .await?;
        tracing::info!(
            "[Executor] Job {} runs nested job {} inline (depth {})",
            call.caller_job_id,
            job.id,
            call.depth
        );
        let remaining = call.deadline.saturating_duration_since(std::time::Instant::now());
        let deadline = Deadline {
            at: Instant::from_std(call.deadline),
            budget: remaining,
        };
        let done = self.run_job(job, call.depth, deadline).await?;
        match done.status {
            JobStatus::Completed => Ok(done.output.unwrap_or_else(|| json!({}))),
            _ => Err(ServerError::Internal(format!(
                "nested job {} failed: {}",
                done.id,
                done.error_message.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl NestedRunner for Executor {
    async fn run_nested(&self, call: NestedCall) -> Result<Value, ServerError> {
        match call.kind {
            TargetKind::Agent => self.run_nested_agent(call).await,
            TargetKind::Workflow => self.run_nested_workflow(call).await,
        }
    }
}

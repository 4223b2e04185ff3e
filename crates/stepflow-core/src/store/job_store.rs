//! Durable job queue.
//!
//! Every status change is a single conditional `UPDATE ... RETURNING`
//! statement scoped to one row, so two callers can never both observe
//! themselves as the winner of a transition.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::job::{Job, JobStatus, JobStep, StepStatus};

const JOB_COLUMNS: &str = "id, workflow_id, status, input, output, working_directory, \
                           error_message, created_at, started_at, completed_at";

const STEP_COLUMNS: &str = "id, job_id, workflow_step_id, step_order, status, input, output, \
                            error_message, created_at, started_at, completed_at";

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        workflow_id: &str,
        input: Value,
        working_directory: Option<String>,
    ) -> Result<Job, ServerError> {
        let job = Job::new(
            Uuid::new_v4().to_string(),
            workflow_id.to_string(),
            input,
            working_directory,
        );
        let jc = job.clone();
        self.db
            .with_conn_async(move |conn| insert_job(conn, &jc))
            .await?;
        tracing::info!("[JobStore] Created job {} for workflow {}", job.id, job.workflow_id);
        Ok(job)
    }

    /// Create a job and claim it for the caller in one transaction, so no
    /// polling worker can take it in between.
    pub async fn create_claimed(
        &self,
        workflow_id: &str,
        input: Value,
        working_directory: Option<String>,
    ) -> Result<Job, ServerError> {
        let job = Job::new(
            Uuid::new_v4().to_string(),
            workflow_id.to_string(),
            input,
            working_directory,
        );
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                insert_job(&tx, &job)?;
                let claimed = tx.query_row(
                    &format!(
                        "UPDATE jobs SET status = 'running', started_at = ?2 \
                         WHERE id = ?1 AND status = 'queued' RETURNING {}",
                        JOB_COLUMNS
                    ),
                    rusqlite::params![job.id, now],
                    |row| Ok(row_to_job(row)),
                )?;
                tx.commit()?;
                Ok(claimed)
            })
            .await
    }

    /// Atomically move the oldest queued job to `running` and return it.
    /// Among concurrent callers exactly one receives any given job.
    pub async fn claim(&self) -> Result<Option<Job>, ServerError> {
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "UPDATE jobs SET status = 'running', started_at = ?1 \
                         WHERE id = (SELECT id FROM jobs WHERE status = 'queued' \
                                     ORDER BY created_at, rowid LIMIT 1) \
                           AND status = 'queued' \
                         RETURNING {}",
                        JOB_COLUMNS
                    ),
                    rusqlite::params![now],
                    |row| Ok(row_to_job(row)),
                )
                .optional()
            })
            .await
    }

    /// The only entry point for status changes besides `claim`. Transitions
    /// outside the status DAG are rejected with `Conflict`.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<Value>,
        error_message: Option<String>,
    ) -> Result<Job, ServerError> {
        let allowed = status.predecessors();
        if allowed.is_empty() {
            return Err(ServerError::BadRequest(format!(
                "job {} cannot be moved to {}",
                id, status
            )));
        }
        let from = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE jobs SET status = ?2, \
                 output = COALESCE(?3, output), \
                 error_message = COALESCE(?4, error_message), \
                 started_at = CASE WHEN ?2 = 'running' THEN ?5 ELSE started_at END, \
                 completed_at = CASE WHEN ?2 IN ('completed', 'failed') THEN ?5 ELSE completed_at END \
             WHERE id = ?1 AND status IN ({}) \
             RETURNING {}",
            from, JOB_COLUMNS
        );

        let id_owned = id.to_string();
        let output = output.map(|v| v.to_string());
        let now = Utc::now().timestamp_millis();
        let (updated, current) = self
            .db
            .with_conn_async(move |conn| {
                let updated = conn
                    .query_row(
                        &sql,
                        rusqlite::params![id_owned, status.as_str(), output, error_message, now],
                        |row| Ok(row_to_job(row)),
                    )
                    .optional()?;
                if updated.is_some() {
                    return Ok((updated, None));
                }
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM jobs WHERE id = ?1",
                        rusqlite::params![id_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok((None, current))
            })
            .await?;

        match (updated, current) {
            (Some(job), _) => {
                tracing::debug!("[JobStore] Job {} -> {}", job.id, job.status);
                Ok(job)
            }
            (None, Some(current)) => Err(ServerError::Conflict(format!(
                "job {} is {} and cannot become {}",
                id, current, status
            ))),
            (None, None) => Err(ServerError::NotFound(format!("job {}", id))),
        }
    }

    pub async fn set_working_directory(&self, id: &str, path: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        let path = path.to_string();
        let n = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE jobs SET working_directory = ?2 WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![id, path],
                )
            })
            .await?;
        if n == 0 {
            return Err(ServerError::Conflict(
                "working directory can only change while a job is running".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_job(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM jobs WHERE (?1 IS NULL OR status = ?1) \
                     ORDER BY created_at DESC, rowid DESC",
                    JOB_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status.map(|s| s.as_str())], |row| {
                        Ok(row_to_job(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a job and its steps. Running jobs are owned by a worker and
    /// cannot be deleted.
    pub async fn delete(&self, id: &str) -> Result<bool, ServerError> {
        let id_owned = id.to_string();
        let (n, running) = self
            .db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM jobs WHERE id = ?1 AND status != 'running'",
                    rusqlite::params![id_owned],
                )?;
                let running: bool = conn
                    .query_row(
                        "SELECT 1 FROM jobs WHERE id = ?1",
                        rusqlite::params![id_owned],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                Ok((n, running))
            })
            .await?;
        if running {
            return Err(ServerError::Conflict(format!("job {} is running", id)));
        }
        Ok(n > 0)
    }

    // ─── Job steps ──────────────────────────────────────────────────────

    /// Record a pending step. The job must be running.
    pub async fn create_step(
        &self,
        job_id: &str,
        workflow_step_id: &str,
        step_order: i64,
        input: Value,
    ) -> Result<JobStep, ServerError> {
        let step = JobStep {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            workflow_step_id: workflow_step_id.to_string(),
            step_order,
            status: StepStatus::Pending,
            input,
            output: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let sc = step.clone();
        let n = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO job_steps (id, job_id, workflow_step_id, step_order, status, input, created_at) \
                     SELECT ?1, ?2, ?3, ?4, 'pending', ?5, ?6 \
                     WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?2 AND status = 'running')",
                    rusqlite::params![
                        sc.id,
                        sc.job_id,
                        sc.workflow_step_id,
                        sc.step_order,
                        sc.input.to_string(),
                        sc.created_at.timestamp_millis(),
                    ],
                )
            })
            .await?;
        if n == 0 {
            return Err(ServerError::Conflict(format!("job {} is not running", job_id)));
        }
        Ok(step)
    }

    /// Move a pending step to running. Fails if another step of the same job
    /// is already running.
    pub async fn start_step(&self, id: &str) -> Result<JobStep, ServerError> {
        let now = Utc::now().timestamp_millis();
        self.transition_step(
            id,
            format!(
                "UPDATE job_steps SET status = 'running', started_at = ?2 \
                 WHERE id = ?1 AND status = 'pending' \
                   AND NOT EXISTS (SELECT 1 FROM job_steps other \
                                   WHERE other.job_id = job_steps.job_id AND other.status = 'running') \
                 RETURNING {}",
                STEP_COLUMNS
            ),
            rusqlite::types::Value::Integer(now),
        )
        .await
    }

    pub async fn complete_step(&self, id: &str, output: &Value) -> Result<JobStep, ServerError> {
        self.transition_step(
            id,
            format!(
                "UPDATE job_steps SET status = 'completed', output = ?2, completed_at = {} \
                 WHERE id = ?1 AND status = 'running' RETURNING {}",
                Utc::now().timestamp_millis(),
                STEP_COLUMNS
            ),
            rusqlite::types::Value::Text(output.to_string()),
        )
        .await
    }

    pub async fn fail_step(&self, id: &str, error: &str) -> Result<JobStep, ServerError> {
        self.transition_step(
            id,
            format!(
                "UPDATE job_steps SET status = 'failed', error_message = ?2, completed_at = {} \
                 WHERE id = ?1 AND status IN ('pending', 'running') RETURNING {}",
                Utc::now().timestamp_millis(),
                STEP_COLUMNS
            ),
            rusqlite::types::Value::Text(error.to_string()),
        )
        .await
    }

    async fn transition_step(
        &self,
        id: &str,
        sql: String,
        arg: rusqlite::types::Value,
    ) -> Result<JobStep, ServerError> {
        let id_owned = id.to_string();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(&sql, rusqlite::params![id_owned, arg], |row| {
                    Ok(row_to_step(row))
                })
                .optional()
            })
            .await?;
        match updated {
            Some(step) => Ok(step),
            None => match self.get_step(id).await? {
                Some(step) => Err(ServerError::Conflict(format!(
                    "job step {} cannot leave state {}",
                    id,
                    step.status.as_str()
                ))),
                None => Err(ServerError::NotFound(format!("job step {}", id))),
            },
        }
    }

    pub async fn get_step(&self, id: &str) -> Result<Option<JobStep>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM job_steps WHERE id = ?1", STEP_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_step(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_steps(&self, job_id: &str) -> Result<Vec<JobStep>, ServerError> {
        let job_id = job_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM job_steps WHERE job_id = ?1 ORDER BY step_order",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![job_id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn insert_job(conn: &rusqlite::Connection, job: &Job) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO jobs (id, workflow_id, status, input, output, working_directory, \
         error_message, created_at, started_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?6, NULL, NULL)",
        rusqlite::params![
            job.id,
            job.workflow_id,
            job.status.as_str(),
            job.input.to_string(),
            job.working_directory,
            job.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn parse_json(raw: Option<String>) -> Option<Value> {
    raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s)))
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Job {
    let status: String = row.get(2).unwrap_or_default();
    Job {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
        input: parse_json(row.get(3).unwrap_or(None)).unwrap_or(Value::Null),
        output: parse_json(row.get(4).unwrap_or(None)),
        working_directory: row.get(5).unwrap_or(None),
        error_message: row.get(6).unwrap_or(None),
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        started_at: to_dt(row.get(8).unwrap_or(None)),
        completed_at: to_dt(row.get(9).unwrap_or(None)),
    }
}

fn row_to_step(row: &rusqlite::Row<'_>) -> JobStep {
    let status: String = row.get(4).unwrap_or_default();
    JobStep {
        id: row.get(0).unwrap_or_default(),
        job_id: row.get(1).unwrap_or_default(),
        workflow_step_id: row.get(2).unwrap_or_default(),
        step_order: row.get(3).unwrap_or_default(),
        status: StepStatus::from_str(&status),
        input: parse_json(row.get(5).unwrap_or(None)).unwrap_or(Value::Null),
        output: parse_json(row.get(6).unwrap_or(None)),
        error_message: row.get(7).unwrap_or(None),
        created_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
        started_at: to_dt(row.get(9).unwrap_or(None)),
        completed_at: to_dt(row.get(10).unwrap_or(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_claim_returns_oldest_queued_job() {
        let store = store();
        let first = store.create("wf", json!({"n": 1}), None).await.unwrap();
        let _second = store.create("wf", json!({"n": 2}), None).await.unwrap();

        let claimed = store.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_on_empty_queue_returns_none() {
        let store = store();
        assert!(store.claim().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_is_exactly_once_under_contention() {
        let store = store();
        let job = store.create("wf", json!({}), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.claim().await.unwrap() }));
        }
        let mut winners = Vec::new();
        for h in handles {
            if let Some(j) = h.await.unwrap() {
                winners.push(j);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].id, job.id);
    }

    #[tokio::test]
    async fn test_update_status_enforces_dag() {
        let store = store();
        let job = store.create("wf", json!({}), None).await.unwrap();

        // queued -> completed skips running
        let err = store
            .update_status(&job.id, JobStatus::Completed, Some(json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));

        store.claim().await.unwrap().unwrap();
        let done = store
            .update_status(&job.id, JobStatus::Completed, Some(json!({"message": "ok"})), None)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.output, Some(json!({"message": "ok"})));
        assert!(done.completed_at.is_some());

        // terminal states are immutable
        let err = store
            .update_status(&job.id, JobStatus::Failed, None, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));
        let reloaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert!(reloaded.error_message.is_none());

        let err = store
            .update_status("missing", JobStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_queued_job_can_fail_directly() {
        let store = store();
        let job = store.create("wf", json!({}), None).await.unwrap();
        let failed = store
            .update_status(&job.id, JobStatus::Failed, None, Some("workflow missing".into()))
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(store.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_claimed_is_not_visible_to_pollers() {
        let store = store();
        let job = store.create_claimed("wf", json!({}), Some("/tmp/x".into())).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.working_directory.as_deref(), Some("/tmp/x"));
        assert!(store.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_steps_run_one_at_a_time() {
        let store = store();
        store.create("wf", json!({}), None).await.unwrap();
        let job = store.claim().await.unwrap().unwrap();

        let s1 = store.create_step(&job.id, "ws1", 1, json!({"prompt": "a"})).await.unwrap();
        let s2 = store.create_step(&job.id, "ws2", 2, json!({})).await.unwrap();
        store.start_step(&s1.id).await.unwrap();

        let err = store.start_step(&s2.id).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));

        let done = store.complete_step(&s1.id, &json!({"message": "A"})).await.unwrap();
        assert_eq!(done.status, StepStatus::Completed);
        store.start_step(&s2.id).await.unwrap();
        let failed = store.fail_step(&s2.id, "boom").await.unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        let steps = store.list_steps(&job.id).await.unwrap();
        assert_eq!(steps.iter().map(|s| s.step_order).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(steps[0].output, Some(json!({"message": "A"})));
    }

    #[tokio::test]
    async fn test_steps_require_running_job() {
        let store = store();
        let job = store.create("wf", json!({}), None).await.unwrap();
        let err = store.create_step(&job.id, "ws1", 1, json!({})).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_refuses_running_jobs() {
        let store = store();
        let job = store.create("wf", json!({}), None).await.unwrap();
        store.claim().await.unwrap();
        assert!(matches!(store.delete(&job.id).await, Err(ServerError::Conflict(_))));

        store
            .update_status(&job.id, JobStatus::Failed, None, Some("x".into()))
            .await
            .unwrap();
        assert!(store.delete(&job.id).await.unwrap());
        assert!(store.get(&job.id).await.unwrap().is_none());
        assert!(!store.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = store();
        store.create("wf", json!({}), None).await.unwrap();
        store.create("wf", json!({}), None).await.unwrap();
        store.claim().await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        assert_eq!(store.list(Some(JobStatus::Queued)).await.unwrap().len(), 1);
        assert_eq!(store.list(Some(JobStatus::Running)).await.unwrap().len(), 1);
    }
}

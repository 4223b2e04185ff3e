use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde_json::Value;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::agent::AgentDef;
use crate::models::module::ModuleDef;
use crate::models::workflow::{StepType, Workflow, WorkflowStep};

/// Persistence for agents, sandbox modules and workflow templates.
#[derive(Clone)]
pub struct DefinitionStore {
    db: Database,
}

impl DefinitionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ─── Agents ─────────────────────────────────────────────────────────

    pub async fn save_agent(&self, agent: &AgentDef) -> Result<(), ServerError> {
        let a = agent.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, provider, base_url, model, api_key, system_prompt, \
                     created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, provider = excluded.provider, \
                     base_url = excluded.base_url, model = excluded.model, api_key = excluded.api_key, \
                     system_prompt = excluded.system_prompt, updated_at = excluded.updated_at",
                    rusqlite::params![
                        a.id,
                        a.name,
                        a.provider,
                        a.base_url,
                        a.model,
                        a.api_key,
                        a.system_prompt,
                        a.created_at.timestamp_millis(),
                        a.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentDef>, ServerError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, provider, base_url, model, api_key, system_prompt, created_at, updated_at \
                     FROM agents ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_agent(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete_agent(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM agents WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }

    // ─── Modules ────────────────────────────────────────────────────────

    /// Store a module. The binary of an existing module can never change;
    /// re-saving the same binary only updates name and config.
    pub async fn save_module(&self, module: &ModuleDef) -> Result<(), ServerError> {
        let m = module.clone();
        let id = module.id.clone();
        let conflict = self
            .db
            .with_conn_async(move |conn| {
                let existing: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT binary FROM wasm_modules WHERE id = ?1",
                        rusqlite::params![m.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(bytes) if bytes != *m.binary => Ok(true),
                    Some(_) => {
                        conn.execute(
                            "UPDATE wasm_modules SET name = ?2, config = ?3, updated_at = ?4 WHERE id = ?1",
                            rusqlite::params![
                                m.id,
                                m.name,
                                m.config.to_string(),
                                m.updated_at.timestamp_millis(),
                            ],
                        )?;
                        Ok(false)
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO wasm_modules (id, name, binary, config, created_at, updated_at) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            rusqlite::params![
                                m.id,
                                m.name,
                                m.binary.as_slice(),
                                m.config.to_string(),
                                m.created_at.timestamp_millis(),
                                m.updated_at.timestamp_millis(),
                            ],
                        )?;
                        Ok(false)
                    }
                }
            })
            .await?;
        if conflict {
            return Err(ServerError::Conflict(format!(
                "module {} already exists with a different binary",
                id
            )));
        }
        Ok(())
    }

    pub async fn list_modules(&self) -> Result<Vec<ModuleDef>, ServerError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, binary, config, created_at, updated_at FROM wasm_modules ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_module(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete_module(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM wasm_modules WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }

    // ─── Workflows ──────────────────────────────────────────────────────

    /// Insert or replace a workflow together with its full step list.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), ServerError> {
        workflow.validate().map_err(ServerError::BadRequest)?;
        let wf = workflow.clone();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO workflows (id, name, description, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                     description = excluded.description, updated_at = excluded.updated_at",
                    rusqlite::params![
                        wf.id,
                        wf.name,
                        wf.description,
                        wf.created_at.timestamp_millis(),
                        wf.updated_at.timestamp_millis(),
                    ],
                )?;
                tx.execute(
                    "DELETE FROM workflow_steps WHERE workflow_id = ?1",
                    rusqlite::params![wf.id],
                )?;
                for step in &wf.steps {
                    tx.execute(
                        "INSERT INTO workflow_steps (id, workflow_id, step_order, step_type, agent_id, \
                         module_id, config) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            step.id,
                            wf.id,
                            step.step_order,
                            step.step_type.as_str(),
                            step.agent_id,
                            step.module_id,
                            step.config.to_string(),
                        ],
                    )?;
                }
                tx.commit()
            })
            .await
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, ServerError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, created_at, updated_at FROM workflows ORDER BY name",
                )?;
                let mut workflows = stmt
                    .query_map([], |row| {
                        let mut wf = Workflow::new(
                            row.get(0).unwrap_or_default(),
                            row.get(1).unwrap_or_default(),
                            row.get(2).unwrap_or(None),
                        );
                        wf.created_at = to_dt(row.get(3).ok()).unwrap_or_else(Utc::now);
                        wf.updated_at = to_dt(row.get(4).ok()).unwrap_or_else(Utc::now);
                        Ok(wf)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut step_stmt = conn.prepare(
                    "SELECT id, workflow_id, step_order, step_type, agent_id, module_id, config \
                     FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order",
                )?;
                for wf in workflows.iter_mut() {
                    wf.steps = step_stmt
                        .query_map(rusqlite::params![wf.id], |row| Ok(row_to_step(row)))?
                        .collect::<Result<Vec<_>, _>>()?;
                }
                Ok(workflows)
            })
            .await
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn parse_object(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> AgentDef {
    AgentDef {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        provider: row.get(2).unwrap_or_default(),
        base_url: row.get(3).unwrap_or(None),
        model: row.get(4).unwrap_or(None),
        api_key: row.get(5).unwrap_or(None),
        system_prompt: row.get(6).unwrap_or_default(),
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
    }
}

fn row_to_module(row: &rusqlite::Row<'_>) -> ModuleDef {
    let binary: Vec<u8> = row.get(2).unwrap_or_default();
    let mut module = ModuleDef::new(
        row.get(0).unwrap_or_default(),
        row.get(1).unwrap_or_default(),
        binary,
        parse_object(row.get(3).unwrap_or(None)),
    );
    module.created_at = to_dt(row.get(4).ok()).unwrap_or_else(Utc::now);
    module.updated_at = to_dt(row.get(5).ok()).unwrap_or_else(Utc::now);
    module
}

fn row_to_step(row: &rusqlite::Row<'_>) -> WorkflowStep {
    let step_type: String = row.get(3).unwrap_or_default();
    WorkflowStep {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        step_order: row.get(2).unwrap_or_default(),
        step_type: StepType::from_str(&step_type).unwrap_or(StepType::Agent),
        agent_id: row.get(4).unwrap_or(None),
        module_id: row.get(5).unwrap_or(None),
        config: parse_object(row.get(6).unwrap_or(None)),
    }
}

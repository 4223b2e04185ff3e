//! SQLite database layer for the Stepflow engine.
//!
//! Uses rusqlite with WAL mode so readers never block the claiming writer.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ServerError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agents (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    provider        TEXT NOT NULL DEFAULT 'echo',
                    base_url        TEXT,
                    model           TEXT,
                    api_key         TEXT,
                    system_prompt   TEXT NOT NULL DEFAULT '',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS wasm_modules (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    binary          BLOB NOT NULL,
                    config          TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    step_order      INTEGER NOT NULL,
                    step_type       TEXT NOT NULL,
                    agent_id        TEXT,
                    module_id       TEXT,
                    config          TEXT NOT NULL DEFAULT '{}',
                    UNIQUE (workflow_id, step_order),
                    CHECK (
                        (step_type = 'agent' AND agent_id IS NOT NULL AND module_id IS NULL)
                        OR (step_type = 'wasm' AND module_id IS NOT NULL AND agent_id IS NULL)
                    )
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow ON workflow_steps(workflow_id);

                CREATE TABLE IF NOT EXISTS jobs (
                    id                  TEXT PRIMARY KEY,
                    workflow_id         TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'queued',
                    input               TEXT NOT NULL DEFAULT '{}',
                    output              TEXT,
                    working_directory   TEXT,
                    error_message       TEXT,
                    created_at          INTEGER NOT NULL,
                    started_at          INTEGER,
                    completed_at        INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

                CREATE TABLE IF NOT EXISTS job_steps (
                    id                  TEXT PRIMARY KEY,
                    job_id              TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    workflow_step_id    TEXT NOT NULL,
                    step_order          INTEGER NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    input               TEXT NOT NULL DEFAULT '{}',
                    output              TEXT,
                    error_message       TEXT,
                    created_at          INTEGER NOT NULL,
                    started_at          INTEGER,
                    completed_at        INTEGER,
                    UNIQUE (job_id, workflow_step_id)
                );
                CREATE INDEX IF NOT EXISTS idx_job_steps_job ON job_steps(job_id);

                CREATE TABLE IF NOT EXISTS settings (
                    key             TEXT PRIMARY KEY,
                    value           TEXT NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                ",
            )
        })
    }
}

//! Shared engine state.

use std::sync::Arc;

use crate::agent::{Agent, AgentRouter};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::ServerError;
use crate::registry::{Registry, Snapshot};
use crate::sandbox::SandboxRuntime;
use crate::store::{DefinitionStore, JobStore, SettingsStore};
use crate::worker::WorkerPool;
use crate::workflow::Executor;

/// Everything a front end (CLI, tests) needs to drive the engine.
pub struct AppStateInner {
    pub db: Database,
    pub job_store: JobStore,
    pub definition_store: DefinitionStore,
    pub settings_store: SettingsStore,
    pub registry: Arc<Registry>,
    pub sandbox: Arc<SandboxRuntime>,
    pub executor: Executor,
    pub config: Arc<EngineConfig>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database, config: EngineConfig) -> Result<Self, ServerError> {
        Self::with_agent(db, config, Arc::new(AgentRouter::new()))
    }

    /// Build the state around a specific agent implementation.
    pub fn with_agent(db: Database, config: EngineConfig, agent: Arc<dyn Agent>) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let job_store = JobStore::new(db.clone());
        let definition_store = DefinitionStore::new(db.clone());
        let settings_store = SettingsStore::new(db.clone());
        let registry = Arc::new(Registry::new(definition_store.clone()));
        let sandbox = Arc::new(SandboxRuntime::new(config.sandbox.clone())?);
        let executor = Executor::new(
            job_store.clone(),
            settings_store.clone(),
            registry.clone(),
            sandbox.clone(),
            agent,
            config.clone(),
        );
        Ok(Self {
            db,
            job_store,
            definition_store,
            settings_store,
            registry,
            sandbox,
            executor,
            config,
        })
    }

    /// Publish a fresh definition snapshot and drop compiled modules that
    /// no longer exist.
    pub async fn reload_definitions(&self) -> Result<Arc<Snapshot>, ServerError> {
        let snapshot = self.registry.reload().await?;
        let current = snapshot.clone();
        self.sandbox.retain(&move |id| current.has_module(id));
        Ok(snapshot)
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.executor.clone(),
            self.config.poll_interval(),
            self.config.max_idle_backoff(),
        )
    }
}

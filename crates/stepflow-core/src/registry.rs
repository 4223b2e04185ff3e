//! Definition registry.
//!
//! Agents, modules and workflows are read from the [`DefinitionStore`] into
//! an immutable [`Snapshot`]. `reload` builds a new snapshot and swaps it in;
//! readers keep whatever `Arc<Snapshot>` they already hold, so no lock is
//! held across agent calls or module runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::ServerError;
use crate::models::agent::AgentDef;
use crate::models::module::ModuleDef;
use crate::models::workflow::Workflow;
use crate::store::DefinitionStore;
use crate::workflow::step::WorkflowPlan;

pub struct Snapshot {
    agents: HashMap<String, Arc<AgentDef>>,
    modules: HashMap<String, Arc<ModuleDef>>,
    workflows: HashMap<String, Arc<WorkflowPlan>>,
    pub loaded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::build(Vec::new(), Vec::new(), Vec::new())
    }

    pub fn build(agents: Vec<AgentDef>, modules: Vec<ModuleDef>, workflows: Vec<Workflow>) -> Self {
        let agents: HashMap<_, _> = agents
            .into_iter()
            .map(|a| (a.id.clone(), Arc::new(a)))
            .collect();
        let modules: HashMap<_, _> = modules
            .into_iter()
            .map(|m| (m.id.clone(), Arc::new(m)))
            .collect();
        let workflows = workflows
            .iter()
            .map(|w| {
                let plan = WorkflowPlan::resolve(w, &agents, &modules);
                if let Some(reason) = &plan.error {
                    tracing::warn!("[Registry] Workflow '{}' cannot run: {}", w.name, reason);
                }
                (w.id.clone(), Arc::new(plan))
            })
            .collect();
        Self {
            agents,
            modules,
            workflows,
            loaded_at: Utc::now(),
        }
    }

    /// Look an agent up by id, then by case-insensitive name.
    pub fn agent(&self, key: &str) -> Option<Arc<AgentDef>> {
        lookup(&self.agents, key, |a| a.name.as_str())
    }

    pub fn module(&self, key: &str) -> Option<Arc<ModuleDef>> {
        lookup(&self.modules, key, |m| m.name.as_str())
    }

    pub fn workflow(&self, key: &str) -> Option<Arc<WorkflowPlan>> {
        lookup(&self.workflows, key, |w| w.name.as_str())
    }

    pub fn has_module(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }
}

fn lookup<T>(map: &HashMap<String, Arc<T>>, key: &str, name: impl Fn(&T) -> &str) -> Option<Arc<T>> {
    if let Some(found) = map.get(key) {
        return Some(found.clone());
    }
    map.values()
        .find(|v| name(&***v).eq_ignore_ascii_case(key))
        .cloned()
}

pub struct Registry {
    store: DefinitionStore,
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new(store: DefinitionStore) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Rebuild the snapshot from the store and publish it.
    pub async fn reload(&self) -> Result<Arc<Snapshot>, ServerError> {
        let agents = self.store.list_agents().await?;
        let modules = self.store.list_modules().await?;
        let workflows = self.store.list_workflows().await?;
        let snapshot = Arc::new(Snapshot::build(agents, modules, workflows));

        tracing::info!(
            "[Registry] Loaded {} agents, {} modules, {} workflows",
            snapshot.agents.len(),
            snapshot.modules.len(),
            snapshot.workflows.len()
        );
        match self.current.write() {
            Ok(mut current) => *current = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::workflow::{StepType, WorkflowStep};
    use crate::workflow::step::StepKind;
    use serde_json::json;

    fn step(order: i64, step_type: StepType, reference: &str) -> WorkflowStep {
        WorkflowStep {
            id: format!("step-{}", order),
            workflow_id: "wf-1".to_string(),
            step_order: order,
            step_type,
            agent_id: (step_type == StepType::Agent).then(|| reference.to_string()),
            module_id: (step_type == StepType::Wasm).then(|| reference.to_string()),
            config: json!({}),
        }
    }

    #[test]
    fn test_lookup_by_id_then_name() {
        let mut wf = Workflow::new("wf-1".into(), "Review Flow".into(), None);
        wf.steps = vec![step(1, StepType::Agent, "echo")];
        let snap = Snapshot::build(
            vec![AgentDef::new("echo".into(), "Echo Agent".into(), "echo".into())],
            vec![],
            vec![wf],
        );

        assert!(snap.workflow("wf-1").is_some());
        assert_eq!(snap.workflow("review flow").unwrap().id, "wf-1");
        assert_eq!(snap.agent("ECHO AGENT").unwrap().id, "echo");
        assert!(snap.agent("nobody").is_none());

        let plan = snap.workflow("wf-1").unwrap();
        assert!(plan.is_runnable());
        assert!(matches!(plan.steps[0].kind, StepKind::Agent(_)));
    }

    #[test]
    fn test_unresolved_reference_marks_plan_broken() {
        let mut wf = Workflow::new("wf-1".into(), "Flow".into(), None);
        wf.steps = vec![
            step(1, StepType::Agent, "echo"),
            step(2, StepType::Wasm, "missing-module"),
        ];
        let snap = Snapshot::build(
            vec![AgentDef::new("echo".into(), "Echo".into(), "echo".into())],
            vec![],
            vec![wf],
        );
        let plan = snap.workflow("wf-1").unwrap();
        assert!(!plan.is_runnable());
        assert!(plan.steps.is_empty());
        assert!(plan.error.as_deref().unwrap().contains("missing-module"));
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let db = Database::open_in_memory().unwrap();
        let store = DefinitionStore::new(db);
        let registry = Registry::new(store.clone());

        let before = registry.snapshot();
        assert_eq!(before.workflow_count(), 0);

        store
            .save_agent(&AgentDef::new("echo".into(), "Echo".into(), "echo".into()))
            .await
            .unwrap();
        let mut wf = Workflow::new("wf-1".into(), "Flow".into(), None);
        wf.steps = vec![step(1, StepType::Agent, "echo")];
        store.save_workflow(&wf).await.unwrap();

        registry.reload().await.unwrap();
        assert_eq!(registry.snapshot().workflow_count(), 1);
        // Holders of the old snapshot are unaffected.
        assert_eq!(before.workflow_count(), 0);
    }
}

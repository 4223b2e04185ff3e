//! YAML bundle format for definitions.
//!
//! A bundle declares agents, sandbox modules and workflows in one file:
//!
//! ```yaml
//! agents:
//!   - id: echo
//!     name: Echo
//!     provider: echo
//!   - id: writer
//!     name: Writer
//!     provider: openai
//!     base_url: "${OPENAI_BASE_URL:-https://api.openai.com/v1}"
//!     model: gpt-4o-mini
//!     api_key: "${OPENAI_API_KEY}"
//!     system_prompt: "You write release notes."
//!
//! modules:
//!   - id: upper
//!     name: Uppercase
//!     path: modules/upper.wasm     # relative to the bundle file
//!     config:
//!       locale: en
//!
//! workflows:
//!   - id: shout
//!     name: Shout
//!     steps:
//!       - type: wasm
//!         module: upper
//!       - type: agent
//!         agent: echo
//!         config:
//!           system_prompt: "Repeat after me."
//! ```
//!
//! Steps are ordered by `order` when given, otherwise by position.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;
use crate::models::agent::AgentDef;
use crate::models::module::ModuleDef;
use crate::models::workflow::{StepType, Workflow, WorkflowStep};
use crate::store::DefinitionStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowBundle {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,

    #[serde(default)]
    pub modules: Vec<ModuleSpec>,

    #[serde(default)]
    pub workflows: Vec<WorkflowSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// "echo", "openai" or "anthropic"
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Supports `${ENV_VAR}` references, resolved at call time.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub system_prompt: String,
}

fn default_provider() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Compiled `.wasm` (or `.wat` text) file.
    pub path: String,

    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// "agent" or "wasm"
    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub module: Option<String>,

    #[serde(default)]
    pub order: Option<i64>,

    #[serde(default)]
    pub config: Option<Value>,
}

/// Counts of what `apply` wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleSummary {
    pub agents: usize,
    pub modules: usize,
    pub workflows: usize,
}

impl WorkflowBundle {
    /// Parse a bundle from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse bundle YAML: {}", e))
    }

    /// Load a bundle from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read bundle file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Expand a path or glob pattern into bundle files, sorted.
    pub fn discover(pattern: &str) -> Result<Vec<PathBuf>, String> {
        let path = Path::new(pattern);
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        if path.is_dir() {
            let mut found = Vec::new();
            for ext in ["yaml", "yml"] {
                let dir_pattern = format!("{}/*.{}", pattern.trim_end_matches('/'), ext);
                found.extend(expand(&dir_pattern)?);
            }
            found.sort();
            return Ok(found);
        }
        let mut found = expand(pattern)?;
        found.sort();
        if found.is_empty() {
            return Err(format!("No bundle files match '{}'", pattern));
        }
        Ok(found)
    }

    /// Convert workflow specs into models, with step ids derived from the
    /// workflow id and order.
    pub fn workflows(&self) -> Result<Vec<Workflow>, String> {
        self.workflows.iter().map(WorkflowSpec::to_workflow).collect()
    }

    /// Check the bundle on its own, plus references to definitions that
    /// already exist outside it.
    pub fn validate_with(
        &self,
        known_agents: &HashSet<String>,
        known_modules: &HashSet<String>,
    ) -> Result<(), String> {
        let mut agents = known_agents.clone();
        for agent in &self.agents {
            if !agents.insert(agent.id.clone()) && !known_agents.contains(&agent.id) {
                return Err(format!("duplicate agent id '{}'", agent.id));
            }
        }
        let mut modules = known_modules.clone();
        for module in &self.modules {
            if !modules.insert(module.id.clone()) && !known_modules.contains(&module.id) {
                return Err(format!("duplicate module id '{}'", module.id));
            }
        }

        let mut workflow_ids = HashSet::new();
        for wf in self.workflows()? {
            if !workflow_ids.insert(wf.id.clone()) {
                return Err(format!("duplicate workflow id '{}'", wf.id));
            }
            wf.validate()?;
            for step in &wf.steps {
                match step.step_type {
                    StepType::Agent => {
                        let id = step.agent_id.as_deref().unwrap_or_default();
                        if !agents.contains(id) {
                            return Err(format!(
                                "workflow '{}' step {} references unknown agent '{}'",
                                wf.id, step.step_order, id
                            ));
                        }
                    }
                    StepType::Wasm => {
                        let id = step.module_id.as_deref().unwrap_or_default();
                        if !modules.contains(id) {
                            return Err(format!(
                                "workflow '{}' step {} references unknown module '{}'",
                                wf.id, step.step_order, id
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.validate_with(&HashSet::new(), &HashSet::new())
    }

    /// Write every definition in the bundle to the store. Module paths are
    /// resolved against `base_dir`.
    pub async fn apply(&self, store: &DefinitionStore, base_dir: &Path) -> Result<BundleSummary, ServerError> {
        let known_agents = store.list_agents().await?.into_iter().map(|a| a.id).collect();
        let known_modules = store.list_modules().await?.into_iter().map(|m| m.id).collect();
        self.validate_with(&known_agents, &known_modules)
            .map_err(ServerError::BadRequest)?;

        let mut summary = BundleSummary::default();
        for spec in &self.agents {
            let mut agent = AgentDef::new(
                spec.id.clone(),
                spec.name.clone().unwrap_or_else(|| spec.id.clone()),
                spec.provider.clone(),
            );
            agent.base_url = spec.base_url.clone();
            agent.model = spec.model.clone();
            agent.api_key = spec.api_key.clone();
            agent.system_prompt = spec.system_prompt.clone();
            store.save_agent(&agent).await?;
            summary.agents += 1;
        }

        for spec in &self.modules {
            let path = base_dir.join(&spec.path);
            let binary = tokio::fs::read(&path).await.map_err(|e| {
                ServerError::BadRequest(format!("Failed to read module '{}' at {}: {}", spec.id, path.display(), e))
            })?;
            let config = spec
                .config
                .clone()
                .unwrap_or_else(crate::models::workflow::empty_object);
            if !config.is_object() {
                return Err(ServerError::BadRequest(format!(
                    "module '{}' config must be an object",
                    spec.id
                )));
            }
            let module = ModuleDef::new(
                spec.id.clone(),
                spec.name.clone().unwrap_or_else(|| spec.id.clone()),
                binary,
                config,
            );
            store.save_module(&module).await?;
            summary.modules += 1;
        }

        for wf in self.workflows().map_err(ServerError::BadRequest)? {
            store.save_workflow(&wf).await?;
            summary.workflows += 1;
        }

        tracing::info!(
            "[Bundle] Applied {} agents, {} modules, {} workflows",
            summary.agents,
            summary.modules,
            summary.workflows
        );
        Ok(summary)
    }
}

impl WorkflowSpec {
    fn to_workflow(&self) -> Result<Workflow, String> {
        let mut wf = Workflow::new(
            self.id.clone(),
            self.name.clone().unwrap_or_else(|| self.id.clone()),
            self.description.clone(),
        );
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, spec) in self.steps.iter().enumerate() {
            let step_type = StepType::from_str(&spec.step_type).ok_or_else(|| {
                format!(
                    "workflow '{}' step {}: unknown type '{}'",
                    self.id,
                    index + 1,
                    spec.step_type
                )
            })?;
            let order = spec.order.unwrap_or(index as i64 + 1);
            steps.push(WorkflowStep {
                id: format!("{}-step-{}", self.id, order),
                workflow_id: self.id.clone(),
                step_order: order,
                step_type,
                agent_id: spec.agent.clone(),
                module_id: spec.module.clone(),
                config: spec
                    .config
                    .clone()
                    .unwrap_or_else(crate::models::workflow::empty_object),
            });
        }
        steps.sort_by_key(|s| s.step_order);
        wf.steps = steps;
        Ok(wf)
    }
}

fn expand(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let paths = glob::glob(pattern).map_err(|e| format!("Invalid pattern '{}': {}", pattern, e))?;
    Ok(paths.filter_map(Result::ok).filter(|p| p.is_file()).collect())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Agent,
    Wasm,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Wasm => "wasm",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Some(Self::Agent),
            "wasm" | "wasm_module" => Some(Self::Wasm),
            _ => None,
        }
    }
}

/// Static definition of one step in a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub step_order: i64,
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default = "empty_object")]
    pub config: Value,
}

impl WorkflowStep {
    /// Check that exactly the reference matching the step type is set.
    pub fn validate(&self) -> Result<(), String> {
        match (self.step_type, &self.agent_id, &self.module_id) {
            (StepType::Agent, Some(_), None) | (StepType::Wasm, None, Some(_)) => {}
            (StepType::Agent, _, _) => {
                return Err(format!("step {} must reference exactly one agent", self.step_order))
            }
            (StepType::Wasm, _, _) => {
                return Err(format!("step {} must reference exactly one module", self.step_order))
            }
        }
        if !self.config.is_object() {
            return Err(format!("step {} config must be an object", self.step_order));
        }
        Ok(())
    }
}

/// An ordered workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(id: String, name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Steps must be non-empty, strictly increasing by `step_order` and
    /// individually well-formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("workflow '{}' has no steps", self.name));
        }
        for pair in self.steps.windows(2) {
            if pair[1].step_order <= pair[0].step_order {
                return Err(format!(
                    "workflow '{}': step_order must be strictly increasing ({} then {})",
                    self.name, pair[0].step_order, pair[1].step_order
                ));
            }
        }
        for step in &self.steps {
            step.validate()
                .map_err(|e| format!("workflow '{}': {}", self.name, e))?;
        }
        Ok(())
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Default::default())
}

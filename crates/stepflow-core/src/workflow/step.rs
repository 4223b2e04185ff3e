//! Steps resolved against a definition snapshot.
//!
//! A workflow step is resolved once, when the registry snapshot is built,
//! into a closed [`StepKind`]. Execution never looks definitions up again.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::io;
use crate::agent::Agent;
use crate::error::ServerError;
use crate::models::agent::AgentDef;
use crate::models::module::ModuleDef;
use crate::models::workflow::{StepType, Workflow};
use crate::sandbox::{Invocation, SandboxRuntime};

#[derive(Clone)]
pub enum StepKind {
    Agent(Arc<AgentDef>),
    Wasm(Arc<ModuleDef>),
}

#[derive(Clone)]
pub struct ResolvedStep {
    /// Id of the workflow step this was resolved from.
    pub id: String,
    pub order: i64,
    pub kind: StepKind,
    pub config: Value,
}

/// What a step needs from the engine to run.
pub struct StepContext<'a> {
    pub agent: &'a dyn Agent,
    pub sandbox: &'a SandboxRuntime,
    pub invocation: Invocation,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub output: Value,
    /// Working directory the step switched the job to.
    pub working_directory: Option<String>,
}

impl ResolvedStep {
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            StepKind::Agent(_) => StepType::Agent.as_str(),
            StepKind::Wasm(_) => StepType::Wasm.as_str(),
        }
    }

    /// The document the step actually receives. WASM steps get the module
    /// config and step config merged underneath the carried input.
    pub fn prepare_input(&self, carried: &Value) -> Value {
        match &self.kind {
            StepKind::Agent(_) => carried.clone(),
            StepKind::Wasm(module) => io::wasm_input(&module.config, &self.config, carried),
        }
    }

    pub async fn execute(&self, ctx: StepContext<'_>, input: &Value) -> Result<StepOutput, ServerError> {
        match &self.kind {
            StepKind::Agent(agent) => {
                let system_prompt = self
                    .config
                    .get("system_prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&agent.system_prompt);
                let output = ctx.agent.invoke(agent, system_prompt, input).await?;
                Ok(StepOutput {
                    output: io::as_output(output),
                    working_directory: None,
                })
            }
            StepKind::Wasm(module) => {
                let out = ctx.sandbox.run(module, input, ctx.invocation).await?;
                Ok(StepOutput {
                    output: out.output,
                    working_directory: out.working_directory,
                })
            }
        }
    }
}

/// A workflow with every step resolved, or the reason it cannot run.
pub struct WorkflowPlan {
    pub id: String,
    pub name: String,
    pub steps: Vec<ResolvedStep>,
    pub error: Option<String>,
}

impl WorkflowPlan {
    pub fn resolve(
        workflow: &Workflow,
        agents: &HashMap<String, Arc<AgentDef>>,
        modules: &HashMap<String, Arc<ModuleDef>>,
    ) -> Self {
        let mut plan = Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            steps: Vec::with_capacity(workflow.steps.len()),
            error: workflow.validate().err(),
        };
        if plan.error.is_some() {
            return plan;
        }

        for step in &workflow.steps {
            let kind = match step.step_type {
                StepType::Agent => step
                    .agent_id
                    .as_ref()
                    .and_then(|id| agents.get(id))
                    .map(|a| StepKind::Agent(a.clone())),
                StepType::Wasm => step
                    .module_id
                    .as_ref()
                    .and_then(|id| modules.get(id))
                    .map(|m| StepKind::Wasm(m.clone())),
            };
            match kind {
                Some(kind) => plan.steps.push(ResolvedStep {
                    id: step.id.clone(),
                    order: step.step_order,
                    kind,
                    config: step.config.clone(),
                }),
                None => {
                    let reference = step
                        .agent_id
                        .as_deref()
                        .or(step.module_id.as_deref())
                        .unwrap_or_default();
                    plan.error = Some(format!(
                        "step {} references unknown {} '{}'",
                        step.step_order,
                        step.step_type.as_str(),
                        reference
                    ));
                    plan.steps.clear();
                    return plan;
                }
            }
        }
        plan
    }

    pub fn is_runnable(&self) -> bool {
        self.error.is_none()
    }
}

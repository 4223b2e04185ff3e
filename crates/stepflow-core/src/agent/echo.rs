use async_trait::async_trait;
use serde_json::{json, Value};

use super::{prompt_text, Agent};
use crate::error::ServerError;
use crate::models::agent::AgentDef;

/// Replies with its input prompt. Useful for wiring tests and dry runs.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn invoke(
        &self,
        agent: &AgentDef,
        _system_prompt: &str,
        input: &Value,
    ) -> Result<Value, ServerError> {
        tracing::debug!("[EchoAgent] {} echoing input", agent.id);
        Ok(json!({ "message": prompt_text(input) }))
    }
}

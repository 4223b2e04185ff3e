//! Agent collaborator: the opaque `invoke(agent, system_prompt, input)` call.
//!
//! The executor never looks inside an agent call. `AgentRouter` picks an
//! implementation from the agent's `provider` field:
//!
//! ```text
//! provider: echo       ──► EchoAgent        (returns `prompt` as `message`)
//! provider: openai     ──► HttpAgentCaller  (POST {base_url}/chat/completions)
//! provider: anthropic  ──► HttpAgentCaller  (POST {base_url}/v1/messages)
//! ```

pub mod echo;
pub mod http;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::models::agent::AgentDef;

pub use echo::EchoAgent;
pub use http::HttpAgentCaller;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one agent turn. The returned document carries the reply in
    /// `message`.
    async fn invoke(
        &self,
        agent: &AgentDef,
        system_prompt: &str,
        input: &Value,
    ) -> Result<Value, ServerError>;
}

/// Dispatches to a concrete agent by provider name.
pub struct AgentRouter {
    echo: EchoAgent,
    http: HttpAgentCaller,
}

impl AgentRouter {
    pub fn new() -> Self {
        Self {
            echo: EchoAgent,
            http: HttpAgentCaller::new(),
        }
    }
}

impl Default for AgentRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for AgentRouter {
    async fn invoke(
        &self,
        agent: &AgentDef,
        system_prompt: &str,
        input: &Value,
    ) -> Result<Value, ServerError> {
        match agent.provider.to_ascii_lowercase().as_str() {
            "echo" => self.echo.invoke(agent, system_prompt, input).await,
            _ => self.http.invoke(agent, system_prompt, input).await,
        }
    }
}

/// Free-text content of a step input: `prompt` when it is a string,
/// otherwise the whole document serialized.
pub fn prompt_text(input: &Value) -> String {
    match input.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        _ => match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Build an agent input from trigger parameters: a `messages` array
/// (user contents joined by newlines) takes precedence over `prompt`.
pub fn input_from_params(params: &Value) -> Value {
    if let Some(messages) = params.get("messages").and_then(|m| m.as_array()) {
        let prompt = messages
            .iter()
            .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
            .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        return json!({ "prompt": prompt });
    }
    match params.get("prompt") {
        Some(p) => json!({ "prompt": p }),
        None => params.clone(),
    }
}

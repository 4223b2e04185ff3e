//! HTTP agent caller: invokes hosted models over their HTTP APIs.
//!
//! Two wire formats are supported:
//! - OpenAI-compatible `POST {base_url}/chat/completions` (default)
//! - Anthropic-compatible `POST {base_url}/v1/messages` (`provider: anthropic`)

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{prompt_text, Agent};
use crate::error::ServerError;
use crate::models::agent::AgentDef;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

pub struct HttpAgentCaller {
    client: reqwest::Client,
}

impl HttpAgentCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn call_openai_compatible(
        &self,
        agent: &AgentDef,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, ServerError> {
        let base_url = agent
            .base_url
            .as_deref()
            .map(resolve_env_vars)
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let model = require_model(agent)?;

        let mut messages = vec![];
        if !system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": system_prompt }));
        }
        messages.push(json!({ "role": "user", "content": user_prompt }));

        let body = json!({ "model": model, "messages": messages });

        tracing::info!("[AgentCaller] Calling chat completions: {} (model: {})", url, model);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = api_key(agent) {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let json = send(request).await?;
        extract_openai_content(&json)
            .ok_or_else(|| ServerError::Agent("response contained no choices".to_string()))
    }

    async fn call_anthropic(
        &self,
        agent: &AgentDef,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, ServerError> {
        let base_url = agent
            .base_url
            .as_deref()
            .map(resolve_env_vars)
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string());
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let model = require_model(agent)?;

        let mut body = json!({
            "model": model,
            "max_tokens": 8192,
            "messages": [{ "role": "user", "content": user_prompt }]
        });
        if !system_prompt.is_empty() {
            body["system"] = Value::String(system_prompt.to_string());
        }

        tracing::info!("[AgentCaller] Calling messages API: {} (model: {})", url, model);

        let mut request = self
            .client
            .post(&url)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = api_key(agent) {
            request = request.header("x-api-key", key);
        }
        let json = send(request).await?;
        extract_anthropic_content(&json)
            .ok_or_else(|| ServerError::Agent("response contained no text blocks".to_string()))
    }
}

impl Default for HttpAgentCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for HttpAgentCaller {
    async fn invoke(
        &self,
        agent: &AgentDef,
        system_prompt: &str,
        input: &Value,
    ) -> Result<Value, ServerError> {
        let prompt = prompt_text(input);
        let content = match agent.provider.to_ascii_lowercase().as_str() {
            "anthropic" => self.call_anthropic(agent, system_prompt, &prompt).await?,
            _ => self.call_openai_compatible(agent, system_prompt, &prompt).await?,
        };
        Ok(json!({ "message": content }))
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value, ServerError> {
    let response = request
        .send()
        .await
        .map_err(|e| ServerError::Agent(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ServerError::Agent(format!("Failed to read response body: {}", e)))?;

    if !status.is_success() {
        return Err(ServerError::Agent(format!("API returned {}: {}", status, text)));
    }

    serde_json::from_str(&text)
        .map_err(|e| ServerError::Agent(format!("Failed to parse response JSON: {}", e)))
}

fn require_model(agent: &AgentDef) -> Result<&str, ServerError> {
    agent
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ServerError::Agent(format!("agent '{}' has no model configured", agent.name)))
}

fn api_key(agent: &AgentDef) -> Option<String> {
    agent
        .api_key
        .as_deref()
        .map(resolve_env_vars)
        .filter(|k| !k.is_empty() && !k.starts_with("${"))
}

fn extract_openai_content(json: &Value) -> Option<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

fn extract_anthropic_content(json: &Value) -> Option<String> {
    json.get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                    } else {
                        None
                    }
                })
                .reduce(|a, b| format!("{}\n{}", a, b))
        })
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

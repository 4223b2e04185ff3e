use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An agent the engine can invoke. Everything past `provider` is opaque
/// to the executor and only interpreted by the agent collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDef {
    pub id: String,
    pub name: String,
    /// "echo", "openai" or "anthropic"
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// May reference environment variables as `${VAR}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentDef {
    pub fn new(id: String, name: String, provider: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            provider,
            base_url: None,
            model: None,
            api_key: None,
            system_prompt: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

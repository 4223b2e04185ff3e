use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A compiled sandbox module plus the static configuration merged under
/// every invocation's input. The binary is write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDef {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub binary: Arc<Vec<u8>>,
    #[serde(default = "crate::models::workflow::empty_object")]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleDef {
    pub fn new(id: String, name: String, binary: Vec<u8>, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            binary: Arc::new(binary),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn size(&self) -> usize {
        self.binary.len()
    }
}

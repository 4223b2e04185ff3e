use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::BridgeState;
use crate::error::ServerError;
use crate::sandbox::abi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Workflow,
    Agent,
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// A nested workflow or agent execution requested by a guest.
#[derive(Debug, Clone)]
pub struct NestedCall {
    pub kind: TargetKind,
    /// Target id or (case-insensitive) name.
    pub target: String,
    pub params: Value,
    pub caller_job_id: String,
    /// Working directory of the calling job, inherited when `params` sets none.
    pub working_directory: Option<String>,
    /// Depth the nested job would run at.
    pub depth: u32,
    pub deadline: Instant,
}

/// Runs nested work on behalf of a sandboxed module. Implemented by the
/// executor; the returned document becomes the guest's last operation result.
#[async_trait]
pub trait NestedRunner: Send + Sync {
    async fn run_nested(&self, call: NestedCall) -> Result<Value, ServerError>;
}

impl BridgeState {
    /// `trigger_workflow_or_agent`: success records status 200, failure
    /// records and returns `NESTED_FAILED`.
    pub fn trigger(&mut self, kind: &str, target: &str, params: &str) -> u32 {
        if self.cancelled() {
            return abi::CANCELLED;
        }
        let params = match serde_json::from_str::<Value>(params) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(Value::Null) => json!({}),
            Ok(_) | Err(_) => {
                tracing::warn!("[HostBridge] Trigger params for '{}' are not a JSON object", target);
                return abi::PARAMS_PARSE_FAILED;
            }
        };
        let Some(kind) = TargetKind::parse(kind) else {
            tracing::warn!("[HostBridge] Invalid trigger type '{}'", kind);
            return abi::INVALID_TARGET_TYPE;
        };

        let outcome = self
            .run_target(kind, target, params)
            .map_err(|e| e.to_string())
            .and_then(|result| self.record_nested_result(abi::TRIGGER_OK_STATUS, &result));
        match outcome {
            Ok(()) => abi::SUCCESS,
            Err(e) => {
                tracing::warn!("[HostBridge] Nested {:?} '{}' failed: {}", kind, target, e);
                self.record_operation(abi::NESTED_FAILED, &json!({ "error": e }));
                abi::NESTED_FAILED
            }
        }
    }

    /// `execute_target`: legacy spelling of `trigger_workflow_or_agent`
    /// with a lowercased type, optional params and its own error codes.
    pub fn execute_target(&mut self, kind: &str, target: &str, params: &str) -> u32 {
        if self.cancelled() {
            return abi::CANCELLED;
        }
        let params = if params.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(params) {
                Ok(Value::Object(map)) => Value::Object(map),
                _ => return abi::legacy::PARSE_FAILED,
            }
        };
        let Some(kind) = TargetKind::parse(&kind.to_ascii_lowercase()) else {
            return abi::legacy::INVALID_TYPE;
        };

        let outcome = self
            .run_target(kind, target, params)
            .map_err(|e| e.to_string())
            .and_then(|result| self.record_nested_result(abi::SUCCESS, &result));
        match outcome {
            Ok(()) => abi::SUCCESS,
            Err(e) => {
                tracing::warn!("[HostBridge] execute_target {:?} '{}' failed: {}", kind, target, e);
                self.record_operation(abi::legacy::FAILED, &json!({ "error": e }));
                abi::legacy::FAILED
            }
        }
    }

    fn run_target(&self, kind: TargetKind, target: &str, params: Value) -> Result<Value, ServerError> {
        let call = NestedCall {
            kind,
            target: target.to_string(),
            params,
            caller_job_id: self.invocation.job_id.clone(),
            working_directory: self.working_directory_opt(),
            depth: self.invocation.depth + 1,
            deadline: self.invocation.deadline,
        };
        tracing::info!(
            "[HostBridge] Job {} triggers {:?} '{}' (depth {})",
            call.caller_job_id,
            kind,
            target,
            call.depth
        );
        let nested = self.invocation.nested.clone();
        self.handle.block_on(async move { nested.run_nested(call).await })
    }
}

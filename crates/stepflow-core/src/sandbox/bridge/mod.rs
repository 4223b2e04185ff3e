//! HostBridge: the `env` functions a sandboxed module may import.
//!
//! ```text
//!  guest (wasm32)                          host
//!  ─────────────────────────────           ───────────────────────────────
//!  http_request(m, url, body)        ──►   BridgeState::http_request
//!  get_last_response_*(buf, len)     ◄──   buffered HttpResponse
//!  trigger_workflow_or_agent(t,id,p) ──►   NestedRunner (executor)
//!  get_last_operation_*(buf, len)    ◄──   buffered OperationResult
//!  get/set_working_directory         ◄─►   per-invocation working dir
//!  create_git_worktree(name, base)   ──►   `git worktree add` beside base
//! ```
//!
//! All arguments are `u32`; variable-size values are (ptr, len) pairs into
//! the guest's `memory` export. Errors are reported as sentinel codes from
//! [`abi`](super::abi) and never trap the guest.
//!
//! Per-invocation state (buffered response, last operation result, working
//! directory) lives in [`BridgeState`] inside the instance's `Store`, so
//! concurrent invocations share nothing.

mod nested;
mod net;
mod workdir;

pub use nested::{NestedCall, NestedRunner, TargetKind};

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use wasmtime::{AsContext, Caller, Linker, StoreLimits};
use wasmtime_wasi::preview1::WasiP1Ctx;

use super::abi;
use super::memory::{self, GuestMemory};
use crate::config::SandboxConfig;

/// Execution context of one module invocation.
#[derive(Clone)]
pub struct Invocation {
    pub job_id: String,
    pub working_directory: Option<String>,
    /// Only the first step of a job may change its working directory.
    pub first_step: bool,
    /// Nesting depth of the job this invocation belongs to (0 = top level).
    pub depth: u32,
    pub deadline: Instant,
    pub nested: Arc<dyn NestedRunner>,
}

/// Store data of a sandbox instance.
pub struct HostState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) bridge: BridgeState,
}

pub(crate) struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Arc<[u8]>,
}

struct OperationResult {
    status: u32,
    result: Arc<[u8]>,
}

pub struct BridgeState {
    handle: tokio::runtime::Handle,
    http: reqwest::Client,
    config: Arc<SandboxConfig>,
    invocation: Invocation,
    last_response: Option<HttpResponse>,
    last_operation: Option<OperationResult>,
    new_working_directory: Option<String>,
}

impl BridgeState {
    pub fn new(
        handle: tokio::runtime::Handle,
        http: reqwest::Client,
        config: Arc<SandboxConfig>,
        invocation: Invocation,
    ) -> Self {
        Self {
            handle,
            http,
            config,
            invocation,
            last_response: None,
            last_operation: None,
            new_working_directory: None,
        }
    }

    pub fn cancelled(&self) -> bool {
        Instant::now() >= self.invocation.deadline
    }

    /// Working directory set by the guest during this invocation, if any.
    pub fn new_working_directory(&self) -> Option<&str> {
        self.new_working_directory.as_deref()
    }

    pub fn response_status(&self) -> u32 {
        match &self.last_response {
            Some(resp) => resp.status as u32,
            None => abi::NO_RESULT,
        }
    }

    pub fn response_body(&self) -> Option<Arc<[u8]>> {
        self.last_response.as_ref().map(|r| r.body.clone())
    }

    /// Header lookup is case-insensitive. `Some(empty)` when a response
    /// exists but lacks the header.
    pub fn response_header(&self, name: &str) -> Option<Vec<u8>> {
        self.last_response.as_ref().map(|resp| {
            resp.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_bytes().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn operation_status(&self) -> u32 {
        self.last_operation.as_ref().map(|op| op.status).unwrap_or(0)
    }

    pub fn operation_result(&self) -> Option<Arc<[u8]>> {
        self.last_operation.as_ref().map(|op| op.result.clone())
    }

    fn record_operation(&mut self, status: u32, result: &Value) {
        self.last_operation = Some(OperationResult {
            status,
            result: Arc::from(encode_result(result)),
        });
    }

    /// Record the result of a nested execution. A result over the buffer
    /// cap is refused whole and the error is returned instead.
    fn record_nested_result(&mut self, status: u32, result: &Value) -> Result<(), String> {
        let bytes = encode_result(result);
        if bytes.len() > self.config.max_buffer_bytes {
            return Err(format!(
                "operation result of {} bytes exceeds {} bytes",
                bytes.len(),
                self.config.max_buffer_bytes
            ));
        }
        self.last_operation = Some(OperationResult {
            status,
            result: Arc::from(bytes),
        });
        Ok(())
    }
}

fn encode_result(result: &Value) -> Vec<u8> {
    match result {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

fn read_bytes(mem: Option<GuestMemory>, store: impl AsContext, ptr: u32, len: u32) -> Option<Vec<u8>> {
    if len == 0 {
        return Some(Vec::new());
    }
    mem?.read_bytes(store, ptr, len).ok()
}

fn read_string(mem: Option<GuestMemory>, store: impl AsContext, ptr: u32, len: u32) -> Option<String> {
    String::from_utf8(read_bytes(mem, store, ptr, len)?).ok()
}

fn deliver(caller: &mut Caller<'_, HostState>, buf_ptr: u32, buf_len: u32, data: &[u8]) -> u32 {
    let mem = GuestMemory::from_caller(caller);
    memory::deliver(mem, caller, buf_ptr, buf_len, data)
}

/// Register every host function under the `env` import module.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "http_request",
        |mut caller: Caller<'_, HostState>,
         method_ptr: u32,
         method_len: u32,
         url_ptr: u32,
         url_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(method) = read_string(mem, &caller, method_ptr, method_len) else {
                return abi::READ_ARG1_FAILED;
            };
            let Some(url) = read_string(mem, &caller, url_ptr, url_len) else {
                return abi::READ_URL_FAILED;
            };
            if caller.data().bridge.url_allowed(&url).is_none() {
                return abi::NOT_PERMITTED;
            }
            let Some(body) = read_bytes(mem, &caller, body_ptr, body_len) else {
                return abi::READ_ARG2_FAILED;
            };
            caller.data_mut().bridge.http_request(&method, &url, body, None)
        },
    )?;

    linker.func_wrap(
        "env",
        "http_request_with_headers",
        |mut caller: Caller<'_, HostState>,
         method_ptr: u32,
         method_len: u32,
         url_ptr: u32,
         url_len: u32,
         body_ptr: u32,
         body_len: u32,
         headers_ptr: u32,
         headers_len: u32|
         -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(method) = read_string(mem, &caller, method_ptr, method_len) else {
                return abi::READ_ARG1_FAILED;
            };
            let Some(url) = read_string(mem, &caller, url_ptr, url_len) else {
                return abi::READ_URL_FAILED;
            };
            if caller.data().bridge.url_allowed(&url).is_none() {
                return abi::NOT_PERMITTED;
            }
            let Some(body) = read_bytes(mem, &caller, body_ptr, body_len) else {
                return abi::READ_ARG2_FAILED;
            };
            let Some(headers) = read_string(mem, &caller, headers_ptr, headers_len) else {
                return abi::READ_ARG3_FAILED;
            };
            caller
                .data_mut()
                .bridge
                .http_request(&method, &url, body, Some(&headers))
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_body",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_len: u32| -> u32 {
            let Some(body) = caller.data().bridge.response_body() else {
                return abi::NO_RESULT;
            };
            deliver(&mut caller, buf_ptr, buf_len, &body)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_status",
        |caller: Caller<'_, HostState>| -> u32 { caller.data().bridge.response_status() },
    )?;

    linker.func_wrap(
        "env",
        "get_last_response_header",
        |mut caller: Caller<'_, HostState>,
         name_ptr: u32,
         name_len: u32,
         buf_ptr: u32,
         buf_len: u32|
         -> u32 {
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(name) = read_string(mem, &caller, name_ptr, name_len) else {
                return abi::READ_HEADER_NAME_FAILED;
            };
            let Some(value) = caller.data().bridge.response_header(&name) else {
                return abi::NO_RESULT;
            };
            if value.is_empty() {
                return 0;
            }
            deliver(&mut caller, buf_ptr, buf_len, &value)
        },
    )?;

    linker.func_wrap(
        "env",
        "trigger_workflow_or_agent",
        |mut caller: Caller<'_, HostState>,
         type_ptr: u32,
         type_len: u32,
         id_ptr: u32,
         id_len: u32,
         params_ptr: u32,
         params_len: u32|
         -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(kind) = read_string(mem, &caller, type_ptr, type_len) else {
                return abi::READ_ARG1_FAILED;
            };
            let Some(target) = read_string(mem, &caller, id_ptr, id_len) else {
                return abi::READ_ARG2_FAILED;
            };
            let Some(params) = read_string(mem, &caller, params_ptr, params_len) else {
                return abi::READ_ARG3_FAILED;
            };
            caller.data_mut().bridge.trigger(&kind, &target, &params)
        },
    )?;

    linker.func_wrap(
        "env",
        "execute_target",
        |mut caller: Caller<'_, HostState>,
         type_ptr: u32,
         type_len: u32,
         id_ptr: u32,
         id_len: u32,
         params_ptr: u32,
         params_len: u32|
         -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(kind) = read_string(mem, &caller, type_ptr, type_len) else {
                return abi::READ_ARG1_FAILED;
            };
            let Some(target) = read_string(mem, &caller, id_ptr, id_len) else {
                return abi::READ_ARG2_FAILED;
            };
            let Some(params) = read_string(mem, &caller, params_ptr, params_len) else {
                return abi::READ_ARG3_FAILED;
            };
            caller.data_mut().bridge.execute_target(&kind, &target, &params)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_operation_result",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_len: u32| -> u32 {
            let Some(result) = caller.data().bridge.operation_result() else {
                return abi::NO_RESULT;
            };
            deliver(&mut caller, buf_ptr, buf_len, &result)
        },
    )?;

    linker.func_wrap(
        "env",
        "get_last_operation_status",
        |caller: Caller<'_, HostState>| -> u32 { caller.data().bridge.operation_status() },
    )?;

    linker.func_wrap(
        "env",
        "get_working_directory",
        |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_len: u32| -> u32 {
            let dir = caller.data().bridge.working_directory().into_bytes();
            deliver(&mut caller, buf_ptr, buf_len, &dir)
        },
    )?;

    linker.func_wrap(
        "env",
        "set_working_directory",
        |mut caller: Caller<'_, HostState>, path_ptr: u32, path_len: u32| -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(path) = read_string(mem, &caller, path_ptr, path_len) else {
                return abi::READ_ARG1_FAILED;
            };
            caller.data_mut().bridge.set_working_directory(&path)
        },
    )?;

    linker.func_wrap(
        "env",
        "create_git_worktree",
        |mut caller: Caller<'_, HostState>,
         name_ptr: u32,
         name_len: u32,
         base_ptr: u32,
         base_len: u32|
         -> u32 {
            if caller.data().bridge.cancelled() {
                return abi::CANCELLED;
            }
            let mem = GuestMemory::from_caller(&mut caller);
            let Some(name) = read_string(mem, &caller, name_ptr, name_len) else {
                return abi::READ_ARG1_FAILED;
            };
            let Some(base) = read_string(mem, &caller, base_ptr, base_len) else {
                return abi::READ_ARG2_FAILED;
            };
            caller.data_mut().bridge.create_git_worktree(&name, &base)
        },
    )?;

    Ok(())
}

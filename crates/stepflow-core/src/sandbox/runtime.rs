use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimitsBuilder, Trap};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::bridge::{self, BridgeState, HostState, Invocation};
use crate::config::SandboxConfig;
use crate::error::ServerError;
use crate::models::module::ModuleDef;
use crate::workflow::io::normalize_wasm_output;

/// Epoch tick used for wall-clock interruption.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Result of one module invocation.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub output: Value,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when the guest called `set_working_directory`.
    pub working_directory: Option<String>,
}

/// Executes compiled modules in fresh, isolated instances.
///
/// Compiled artifacts are cached by module id; instances never are. Each
/// invocation gets its own `Store` with its own WASI context, memory limit,
/// fuel budget and epoch deadline.
pub struct SandboxRuntime {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    modules: RwLock<HashMap<String, Module>>,
    config: Arc<SandboxConfig>,
    http: reqwest::Client,
    _ticker: EpochTicker,
}

impl SandboxRuntime {
    pub fn new(config: SandboxConfig) -> Result<Self, ServerError> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.consume_fuel(true);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| ServerError::Sandbox(format!("Failed to create engine: {}", e)))?;

        let mut linker: Linker<HostState> = Linker::new(&engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| ServerError::Sandbox(format!("Failed to link WASI: {}", e)))?;
        bridge::add_to_linker(&mut linker)
            .map_err(|e| ServerError::Sandbox(format!("Failed to link host functions: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| ServerError::Sandbox(format!("Failed to build HTTP client: {}", e)))?;

        let ticker = EpochTicker::start(engine.clone())?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            modules: RwLock::new(HashMap::new()),
            config: Arc::new(config),
            http,
            _ticker: ticker,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile `module` into the cache ahead of its first invocation.
    pub fn load_module(&self, module: &ModuleDef) -> Result<(), ServerError> {
        self.compiled(module).map(|_| ())
    }

    /// Drop the compiled artifact of a module. Returns whether one was cached.
    pub fn invalidate(&self, module_id: &str) -> bool {
        let removed = self
            .modules
            .write()
            .map(|mut cache| cache.remove(module_id).is_some())
            .unwrap_or(false);
        if removed {
            tracing::debug!("[Sandbox] Invalidated module {}", module_id);
        }
        removed
    }

    /// Drop every cached module whose id is not in `keep`.
    pub fn retain(&self, keep: &dyn Fn(&str) -> bool) {
        if let Ok(mut cache) = self.modules.write() {
            cache.retain(|id, _| keep(id));
        }
    }

    pub fn is_cached(&self, module_id: &str) -> bool {
        self.modules
            .read()
            .map(|cache| cache.contains_key(module_id))
            .unwrap_or(false)
    }

    fn compiled(&self, module: &ModuleDef) -> Result<Module, ServerError> {
        if let Some(found) = self
            .modules
            .read()
            .ok()
            .and_then(|cache| cache.get(&module.id).cloned())
        {
            return Ok(found);
        }

        let started = Instant::now();
        let compiled = Module::new(&self.engine, module.binary.as_slice()).map_err(|e| {
            ServerError::Sandbox(format!("Failed to compile module '{}': {}", module.name, e))
        })?;
        tracing::info!(
            "[Sandbox] Compiled module {} ({} bytes) in {:?}",
            module.id,
            module.size(),
            started.elapsed()
        );
        if let Ok(mut cache) = self.modules.write() {
            cache.insert(module.id.clone(), compiled.clone());
        }
        Ok(compiled)
    }

    /// Run `module` once with `input` on stdin.
    ///
    /// The wall-clock limit is the configured sandbox timeout or the time
    /// left before the invocation's deadline, whichever is shorter.
    pub async fn run(
        &self,
        module: &ModuleDef,
        input: &Value,
        invocation: Invocation,
    ) -> Result<SandboxOutput, ServerError> {
        let compiled = self.compiled(module)?;

        let remaining = invocation.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ServerError::Timeout(format!(
                "module '{}' not started: job deadline passed",
                module.name
            )));
        }
        let timeout = self.config.timeout().min(remaining);

        let stdin = match input {
            Value::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        };

        let working_directory = invocation.working_directory.clone();
        let job = RunJob {
            engine: self.engine.clone(),
            linker: self.linker.clone(),
            module: compiled,
            module_name: module.name.clone(),
            config: self.config.clone(),
            bridge: BridgeState::new(
                tokio::runtime::Handle::current(),
                self.http.clone(),
                self.config.clone(),
                invocation,
            ),
            working_directory,
            stdin,
            timeout,
        };

        tracing::debug!("[Sandbox] Running module {} (timeout {:?})", module.id, timeout);
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| ServerError::Internal(format!("Sandbox task failed: {}", e)))?
    }
}

/// Everything one blocking invocation needs, moved onto the blocking pool.
struct RunJob {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    module: Module,
    module_name: String,
    config: Arc<SandboxConfig>,
    bridge: BridgeState,
    working_directory: Option<String>,
    stdin: Vec<u8>,
    timeout: Duration,
}

impl RunJob {
    fn run(self) -> Result<SandboxOutput, ServerError> {
        let stdout = MemoryOutputPipe::new(self.config.max_buffer_bytes);
        let stderr = MemoryOutputPipe::new(self.config.max_buffer_bytes);

        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(self.stdin))
            .stdout(stdout.clone())
            .stderr(stderr.clone());
        if let Some(dir) = &self.working_directory {
            if !std::path::Path::new(dir).exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ServerError::Sandbox(format!("Failed to create working directory {}: {}", dir, e))
                })?;
            }
            builder
                .preopened_dir(dir, "/", DirPerms::all(), FilePerms::all())
                .and_then(|b| b.preopened_dir(dir, ".", DirPerms::all(), FilePerms::all()))
                .map_err(|e| ServerError::Sandbox(format!("Failed to preopen {}: {}", dir, e)))?;
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory_bytes)
            .build();
        let mut store = Store::new(
            &self.engine,
            HostState {
                wasi: builder.build_p1(),
                limits,
                bridge: self.bridge,
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.fuel)
            .map_err(|e| ServerError::Sandbox(format!("Failed to set fuel: {}", e)))?;
        let ticks = (self.timeout.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64;
        store.set_epoch_deadline(ticks);

        let started = Instant::now();
        let outcome = self
            .linker
            .instantiate(&mut store, &self.module)
            .and_then(|instance| {
                if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
                    init.call(&mut store, ())?;
                }
                match instance.get_typed_func::<(), ()>(&mut store, "_start") {
                    Ok(start) => start.call(&mut store, ()),
                    Err(_) => {
                        tracing::debug!("[Sandbox] Module {} exports no _start", self.module_name);
                        Ok(())
                    }
                }
            });

        let stderr_bytes = stderr.contents().to_vec();
        if !stderr_bytes.is_empty() {
            tracing::debug!(
                "[Sandbox] {} stderr: {}",
                self.module_name,
                String::from_utf8_lossy(&stderr_bytes).trim_end()
            );
        }

        classify(outcome, &self.module_name, self.timeout, &stderr_bytes)?;

        let stdout_bytes = stdout.contents().to_vec();
        let new_wd = store.data().bridge.new_working_directory().map(String::from);
        tracing::debug!(
            "[Sandbox] Module {} finished in {:?} ({} bytes out)",
            self.module_name,
            started.elapsed(),
            stdout_bytes.len()
        );

        Ok(SandboxOutput {
            output: normalize_wasm_output(&stdout_bytes),
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            working_directory: new_wd,
        })
    }
}

/// Map the guest's termination to a step result. A WASI exit with code 0
/// is a normal completion.
fn classify(
    outcome: anyhow::Result<()>,
    module_name: &str,
    timeout: Duration,
    stderr: &[u8],
) -> Result<(), ServerError> {
    let err = match outcome {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        if exit.0 == 0 {
            return Ok(());
        }
        let tail = String::from_utf8_lossy(stderr);
        return Err(ServerError::Sandbox(format!(
            "module '{}' exited with code {}{}",
            module_name,
            exit.0,
            if tail.trim().is_empty() {
                String::new()
            } else {
                format!(": {}", tail.trim())
            }
        )));
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => Err(ServerError::Timeout(format!(
            "sandbox timed out after {}ms",
            timeout.as_millis()
        ))),
        Some(Trap::OutOfFuel) => Err(ServerError::Sandbox(
            "sandbox exhausted its instruction budget".to_string(),
        )),
        Some(trap) => Err(ServerError::Sandbox(format!(
            "module '{}' trapped: {}",
            module_name, trap
        ))),
        None => Err(ServerError::Sandbox(format!(
            "module '{}' failed: {:#}",
            module_name, err
        ))),
    }
}

/// Background thread advancing the engine epoch. Stops when dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self, ServerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("stepflow-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| ServerError::Sandbox(format!("Failed to start epoch ticker: {}", e)))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(id: &str, wat: &str) -> ModuleDef {
        ModuleDef::new(id.to_string(), id.to_string(), wat.as_bytes().to_vec(), json!({}))
    }

    #[test]
    fn test_compiled_modules_are_cached_by_id() {
        let runtime = SandboxRuntime::new(SandboxConfig::default()).unwrap();
        runtime.load_module(&module("a", "(module)")).unwrap();
        runtime.load_module(&module("b", "(module)")).unwrap();
        assert!(runtime.is_cached("a"));

        assert!(runtime.invalidate("a"));
        assert!(!runtime.invalidate("a"));

        runtime.retain(&|id| id != "b");
        assert!(!runtime.is_cached("b"));
    }

    #[test]
    fn test_invalid_binary_is_a_sandbox_error() {
        let runtime = SandboxRuntime::new(SandboxConfig::default()).unwrap();
        let err = runtime.load_module(&module("bad", "not wasm")).unwrap_err();
        assert!(matches!(err, ServerError::Sandbox(_)));
        assert!(!runtime.is_cached("bad"));
    }

    #[test]
    fn test_exit_codes() {
        let timeout = Duration::from_millis(5);
        assert!(classify(Err(I32Exit(0).into()), "m", timeout, b"").is_ok());
        let err = classify(Err(I32Exit(7).into()), "m", timeout, b"boom\n").unwrap_err();
        assert_eq!(err.to_string(), "Sandbox error: module 'm' exited with code 7: boom");
        let err = classify(Err(Trap::Interrupt.into()), "m", timeout, b"").unwrap_err();
        assert!(matches!(err, ServerError::Timeout(ref msg) if msg == "sandbox timed out after 5ms"));
    }
}

//! Stepflow Core: job queue, step executor and sandboxed module host.
//!
//! A workflow is an ordered list of steps. Each step either calls an agent
//! (an LLM provider, or the built-in echo agent) or runs a WebAssembly
//! module in a fresh sandbox instance. Jobs are queued in SQLite and
//! claimed exactly once by a pool of workers; modules reach back into the
//! engine through a small host-function bridge.
//!
//! This crate has no CLI or HTTP dependency; `stepflow-cli` is the front end.

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod registry;
pub mod sandbox;
pub mod state;
pub mod store;
pub mod worker;
pub mod workflow;

// Convenience re-exports
pub use config::{EngineConfig, SandboxConfig};
pub use db::Database;
pub use error::ServerError;
pub use state::{AppState, AppStateInner};
pub use worker::{WorkerHandle, WorkerPool};
pub use workflow::Executor;

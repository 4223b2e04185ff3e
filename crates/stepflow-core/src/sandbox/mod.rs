//! Sandboxed module execution.
//!
//! A module is a compiled WASI command. Its input is one JSON document on
//! stdin; its output is whatever it writes to stdout before exiting. The
//! only host access it gets beyond WASI stdio and an optional preopened
//! working directory is the [`bridge`] ABI.

pub mod abi;
pub mod bridge;
pub mod memory;
mod runtime;

pub use bridge::{Invocation, NestedCall, NestedRunner, TargetKind};
pub use memory::GuestMemory;
pub use runtime::{SandboxOutput, SandboxRuntime};

//! Workflow engine: ordered agent and sandbox steps over a job.
//!
//! # Architecture
//!
//! ```text
//! bundle.yaml ──► WorkflowBundle ──► DefinitionStore ──► Registry snapshot
//!                                                             │
//!                                                       WorkflowPlan
//!                                                             │
//!  JobStore ◄──── Executor ──► ResolvedStep ──┬── Agent (echo / HTTP)
//!                    ▲                         └── SandboxRuntime ──► HostBridge
//!                    └──────────── nested triggers ◄──────────────────────┘
//! ```

pub mod executor;
pub mod io;
pub mod schema;
pub mod step;

pub use executor::Executor;
pub use schema::{BundleSummary, WorkflowBundle};
pub use step::{ResolvedStep, StepKind, StepOutput, WorkflowPlan};

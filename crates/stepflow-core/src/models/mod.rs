pub mod agent;
pub mod job;
pub mod module;
pub mod workflow;

pub use agent::*;
pub use job::*;
pub use module::*;
pub use workflow::*;

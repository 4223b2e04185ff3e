pub mod definition_store;
pub mod job_store;
pub mod settings_store;

pub use definition_store::DefinitionStore;
pub use job_store::JobStore;
pub use settings_store::SettingsStore;

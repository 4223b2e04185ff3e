//! Core error type for the Stepflow engine.
//!
//! `ServerError` is used throughout the core domain (stores, executor,
//! sandbox). Step failures carry the variant's message into the job record,
//! so the `Display` text is what operators read.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ServerError {
    /// True for errors caused by the job store being unavailable.
    pub fn is_database(&self) -> bool {
        matches!(self, ServerError::Database(_))
    }
}

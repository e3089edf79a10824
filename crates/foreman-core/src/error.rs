//! Unified error types for Foreman

use thiserror::Error;

/// Unified error type for all Foreman operations
#[derive(Error, Debug)]
pub enum ForemanError {
    // Store errors
    #[error("store error: {0}")]
    Store(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    // Mailbox errors
    #[error("mailbox error: {0}")]
    Mailbox(String),

    // Scheduler errors
    #[error("scheduler error: {0}")]
    Scheduler(String),

    // Supervisor errors
    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error("agent launch failed: {0}")]
    Launch(String),

    #[error("restart budget exhausted for agent: {0}")]
    RestartBudgetExhausted(String),

    // Resource errors
    #[error("resource budget exceeded: {0}")]
    ResourceExhausted(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using ForemanError
pub type Result<T> = std::result::Result<T, ForemanError>;

//! Error types for the provisioning console

use thiserror::Error;

/// Main error type for the provisioning console
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Migration {version} ({description}) failed: {source}")]
    MigrationError {
        version: u32,
        description: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Schema version {found} is newer than the latest supported version {supported}")]
    UnsupportedSchemaVersion { supported: u32, found: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task is not active: {0}")]
    TaskNotActive(String),

    #[error("Unknown playbook sequence: {0}")]
    UnknownSequence(String),

    #[error("Step error: {0}")]
    StepError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConsoleError {
    /// Whether this error is the distinguished "no such row" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsoleError::NotFound(_))
    }
}

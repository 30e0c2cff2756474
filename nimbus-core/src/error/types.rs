//! The `NimbusError` enum and its result alias

use thiserror::Error;

/// Error type for every Nimbus operation
#[derive(Error, Debug)]
pub enum NimbusError {
    // Access
    #[error("User is not authorized for this action")]
    Unauthorized { action: String },

    #[error("Security error: {message}")]
    Security { message: String },

    // Resource Management
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("{resource} is still in use by {holders}")]
    InUse { resource: String, holders: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    // Storage Errors
    #[error("Storage error: {0}")]
    StorageError(#[from] Box<redb::Error>),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Database error: {operation} failed")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Serialization & IO Errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] Box<bincode::Error>),

    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    // Remote execution
    #[error("Script {script} failed on host {host}: {stderr}")]
    RemoteExecution {
        script: String,
        host: String,
        stdout: String,
        stderr: String,
    },

    // Logic Errors
    #[error("Scheduling error: {message}")]
    SchedulingError { message: String },

    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    // Operational Errors
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Duplicate request rejected: {command}")]
    DuplicateRequest { command: String },

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    // Multiple Errors
    #[error("Multiple errors in {context}: {}", format_errors(.errors))]
    Multiple {
        context: String,
        errors: Vec<NimbusError>,
    },
}

/// Numbered, `; `-joined rendering of nested errors
pub fn format_errors(errors: &[NimbusError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type NimbusResult<T> = std::result::Result<T, NimbusError>;

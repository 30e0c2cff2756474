//! `From` impls that let `?` lift redb, codec, io and tokio errors

use super::types::NimbusError;

// Storage error conversions
impl From<redb::TransactionError> for NimbusError {
    fn from(err: redb::TransactionError) -> Self {
        NimbusError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for NimbusError {
    fn from(err: redb::TableError) -> Self {
        NimbusError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for NimbusError {
    fn from(err: redb::StorageError) -> Self {
        NimbusError::Storage {
            operation: "storage_operation".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::DatabaseError> for NimbusError {
    fn from(err: redb::DatabaseError) -> Self {
        NimbusError::DatabaseError {
            operation: "database_operation".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::CommitError> for NimbusError {
    fn from(err: redb::CommitError) -> Self {
        NimbusError::Storage {
            operation: "commit".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<redb::Error> for NimbusError {
    fn from(err: redb::Error) -> Self {
        NimbusError::StorageError(Box::new(err))
    }
}

// Serialization error conversions
impl From<bincode::Error> for NimbusError {
    fn from(err: bincode::Error) -> Self {
        NimbusError::SerializationError(Box::new(err))
    }
}

impl From<serde_json::Error> for NimbusError {
    fn from(err: serde_json::Error) -> Self {
        NimbusError::JsonError(Box::new(err))
    }
}

impl From<toml::de::Error> for NimbusError {
    fn from(err: toml::de::Error) -> Self {
        NimbusError::ConfigurationError {
            component: "toml".to_string(),
            message: err.to_string(),
        }
    }
}

// System error conversions
impl From<std::io::Error> for NimbusError {
    fn from(err: std::io::Error) -> Self {
        NimbusError::IoError(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for NimbusError {
    fn from(err: tokio::task::JoinError) -> Self {
        NimbusError::Internal {
            message: format!("Task join error: {}", err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NimbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NimbusError::Timeout {
            operation: "unknown".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}

// Parsing error conversions
impl From<std::net::AddrParseError> for NimbusError {
    fn from(err: std::net::AddrParseError) -> Self {
        NimbusError::Validation {
            field: "ip".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for NimbusError {
    fn from(err: std::num::ParseIntError) -> Self {
        NimbusError::Validation {
            field: "number".to_string(),
            message: err.to_string(),
        }
    }
}

//! Constructor methods and convenience functions for NimbusError
//!
//! This module provides factory methods for creating structured errors
//! with proper context and error chaining.

use super::types::NimbusError;

impl NimbusError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use nimbus_core::error::NimbusError;
    ///
    /// let err = NimbusError::configuration("placement.vcpu_to_physical_cpu_factor", "must be positive");
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        NimbusError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a Storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        NimbusError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a DatabaseError with a boxed source
    pub fn database<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        NimbusError::DatabaseError {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn unauthorized(action: impl std::fmt::Display) -> Self {
        NimbusError::Unauthorized {
            action: action.to_string(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        NimbusError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        NimbusError::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn in_use(resource: impl Into<String>, holders: impl Into<String>) -> Self {
        NimbusError::InUse {
            resource: resource.into(),
            holders: holders.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NimbusError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        NimbusError::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        NimbusError::Internal {
            message: message.into(),
        }
    }

    /// Failure of a host-side script, keeping its captured output
    pub fn remote(
        script: impl Into<String>,
        host: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        NimbusError::RemoteExecution {
            script: script.into(),
            host: host.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, NimbusError::Unauthorized { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NimbusError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, NimbusError::AlreadyExists { .. })
    }

    /// Stdout captured from a failed host-side script, if any
    pub fn remote_stdout(&self) -> Option<&str> {
        match self {
            NimbusError::RemoteExecution { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_hides_action() {
        let err = NimbusError::unauthorized("edit_cloud_resource");
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "User is not authorized for this action");
    }

    #[test]
    fn test_remote_error_keeps_output() {
        let err = NimbusError::remote("createVM.sh", "h1", "partial", "disk full");
        assert_eq!(err.remote_stdout(), Some("partial"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_multiple_formats_every_error() {
        let err = NimbusError::Multiple {
            context: "rollback".to_string(),
            errors: vec![
                NimbusError::not_found("VM web1"),
                NimbusError::internal("boom"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("1. Resource not found: VM web1"));
        assert!(text.contains("2. Internal error: boom"));
    }
}

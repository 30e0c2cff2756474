//! Uniform result shape returned by every command

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NimbusError;

/// Message shown for every authorization failure, whatever the scope
pub const UNAUTHORIZED_MESSAGE: &str = "User is not authorized for this action";

/// `{result, out, err}` plus any command specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub result: bool,
    pub out: String,
    pub err: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResult {
    pub fn ok(out: impl Into<String>) -> Self {
        Self {
            result: true,
            out: out.into(),
            err: String::new(),
            extra: Map::new(),
        }
    }

    pub fn failed(err: impl Into<String>) -> Self {
        Self {
            result: false,
            out: String::new(),
            err: err.into(),
            extra: Map::new(),
        }
    }

    /// Success that needs an operator's attention
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.err = warning.into();
        self
    }

    /// Attach a data field; values that fail to serialize are dropped
    pub fn with_data(mut self, key: &str, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.extra.insert(key.to_string(), value);
            }
            Err(e) => tracing::error!(key, "Result field could not be serialized: {}", e),
        }
        self
    }

    pub fn from_error(error: &NimbusError) -> Self {
        if error.is_unauthorized() {
            return Self::failed(UNAUTHORIZED_MESSAGE);
        }
        let mut result = Self::failed(error.to_string());
        if let Some(stdout) = error.remote_stdout() {
            result.out = stdout.to_string();
        }
        result
    }

    pub fn data(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

impl From<NimbusError> for CommandResult {
    fn from(error: NimbusError) -> Self {
        Self::from_error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unauthorized_hides_scope() {
        let result = CommandResult::from_error(&NimbusError::unauthorized("scope of acme_x_vm"));
        assert!(!result.result);
        assert_eq!(result.err, UNAUTHORIZED_MESSAGE);
    }

    #[test]
    fn test_data_fields_are_flattened() {
        let result = CommandResult::ok("listed").with_data("ips", vec!["1.2.3.4"]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], true);
        assert_eq!(json["ips"][0], "1.2.3.4");
    }

    #[test]
    fn test_remote_failure_keeps_stdout() {
        let result = CommandResult::from_error(&NimbusError::remote(
            "createVM.sh",
            "h1",
            "partial log",
            "disk full",
        ));
        assert_eq!(result.out, "partial log");
        assert!(result.err.contains("createVM.sh"));
    }
}

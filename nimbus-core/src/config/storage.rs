//! Storage and at-rest security configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::*;
use crate::error::{NimbusError, NimbusResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the redb database file
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> NimbusResult<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("NIMBUS_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        Ok(config)
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(NimbusError::configuration(
                "storage.database_path",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Where the host password master key comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Environment variable holding 64 hex characters (32 bytes)
    pub master_key_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> NimbusResult<()> {
        if self.master_key_env.trim().is_empty() {
            return Err(NimbusError::configuration(
                "security.master_key_env",
                "must name an environment variable",
            ));
        }
        Ok(())
    }
}

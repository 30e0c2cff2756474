//! Command dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::*;
use super::{parse_env, parse_secs_env};
use crate::error::{NimbusError, NimbusResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Wall-clock budget per command
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Reject exact repeats of an in-flight or recent request
    pub duplicate_check_enabled: bool,

    /// How long a request hash is remembered
    #[serde(with = "humantime_serde")]
    pub duplicate_check_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            duplicate_check_enabled: true,
            duplicate_check_window: Duration::from_secs(DEFAULT_DUPLICATE_CHECK_WINDOW_SECS),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> NimbusResult<Self> {
        let mut config = Self::default();
        config.command_timeout =
            parse_secs_env("NIMBUS_COMMAND_TIMEOUT_SECS", config.command_timeout)?;
        if let Some(enabled) = parse_env("NIMBUS_DUPLICATE_CHECK_ENABLED")? {
            config.duplicate_check_enabled = enabled;
        }
        config.duplicate_check_window = parse_secs_env(
            "NIMBUS_DUPLICATE_CHECK_WINDOW_SECS",
            config.duplicate_check_window,
        )?;
        Ok(config)
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if self.command_timeout.is_zero() {
            return Err(NimbusError::configuration(
                "dispatcher.command_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

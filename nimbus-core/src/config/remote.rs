//! Remote execution configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::*;
use super::parse_secs_env;
use crate::error::{NimbusError, NimbusResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Local directory holding the host-side `.sh` scripts
    pub script_dir: PathBuf,

    /// Program used to reach a host
    pub runner: String,

    /// Extra arguments placed before the runner's own options
    pub runner_args: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a single script run
    #[serde(with = "humantime_serde")]
    pub script_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from(DEFAULT_SCRIPT_DIR),
            runner: DEFAULT_REMOTE_RUNNER.to_string(),
            runner_args: DEFAULT_REMOTE_RUNNER_ARGS.map(String::from).to_vec(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            script_timeout: Duration::from_secs(DEFAULT_SCRIPT_TIMEOUT_SECS),
        }
    }
}

impl RemoteConfig {
    pub fn from_env() -> NimbusResult<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("NIMBUS_SCRIPT_DIR") {
            config.script_dir = PathBuf::from(dir);
        }
        if let Ok(runner) = std::env::var("NIMBUS_REMOTE_RUNNER") {
            config.runner = runner;
            config.runner_args = std::env::var("NIMBUS_REMOTE_RUNNER_ARGS")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default();
        }
        config.connect_timeout =
            parse_secs_env("NIMBUS_CONNECT_TIMEOUT_SECS", config.connect_timeout)?;
        config.script_timeout =
            parse_secs_env("NIMBUS_SCRIPT_TIMEOUT_SECS", config.script_timeout)?;
        Ok(config)
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if self.runner.trim().is_empty() {
            return Err(NimbusError::configuration("remote.runner", "must not be empty"));
        }
        let is_sshpass = std::path::Path::new(self.runner.trim())
            .file_name()
            .is_some_and(|name| name == "sshpass");
        if is_sshpass && !self.runner_args.iter().any(|arg| arg == "-e") {
            return Err(NimbusError::configuration(
                "remote.runner_args",
                "sshpass needs -e to read the host password from SSHPASS",
            ));
        }
        if self.script_timeout < self.connect_timeout {
            return Err(NimbusError::configuration(
                "remote.script_timeout",
                "must not be shorter than connect_timeout",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runner_consumes_password() {
        let config = RemoteConfig::default();
        assert_eq!(config.runner, "sshpass");
        assert_eq!(config.runner_args, vec!["-e", "ssh"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sshpass_without_env_flag_is_rejected() {
        let config = RemoteConfig {
            runner: "/usr/bin/sshpass".to_string(),
            runner_args: vec!["ssh".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NimbusError::ConfigurationError { .. })
        ));

        let plain_ssh = RemoteConfig {
            runner: "ssh".to_string(),
            runner_args: Vec::new(),
            ..Default::default()
        };
        assert!(plain_ssh.validate().is_ok());
    }
}

//! Remote executor that pipes scripts over an SSH child process

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use super::{RemoteCommand, RemoteExecutor, RemoteOutput};
use crate::config::RemoteConfig;
use crate::error::{NimbusError, NimbusResult};

/// Environment variable the runner reads the host password from
const PASSWORD_ENV: &str = "SSHPASS";

/// [`RemoteExecutor`] that spawns the configured runner (`sshpass -e ssh` by default)
///
/// The script body is read from the script directory and fed to
/// `bash -s` on the host, so hosts need no copy of the scripts.
#[derive(Debug, Clone)]
pub struct ProcessRemoteExecutor {
    config: RemoteConfig,
}

impl ProcessRemoteExecutor {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn runner_args(&self, command: &RemoteCommand) -> Vec<String> {
        let credentials = &command.host.credentials;
        let mut args = self.config.runner_args.clone();
        args.extend([
            "-p".to_string(),
            credentials.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs()),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!(
                "KnownHostsCommand=/bin/echo {} {}",
                shell_quote(&known_hosts_name(&command.host.address, credentials.port)),
                shell_quote(&credentials.host_key)
            ),
            format!("{}@{}", credentials.user, command.host.address),
        ]);

        let mut remote = vec!["bash".to_string(), "-s".to_string(), "--".to_string()];
        remote.extend(command.args.iter().map(|arg| shell_quote(arg)));
        args.push(remote.join(" "));
        args
    }
}

/// Host as `known_hosts` names it: bare on port 22, `[address]:port` otherwise
fn known_hosts_name(address: &str, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{}]:{}", address, port)
    }
}

/// Quote one argument for the remote shell
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[async_trait]
impl RemoteExecutor for ProcessRemoteExecutor {
    #[instrument(skip(self, command), fields(script = %command.script, host = %command.host.hostname))]
    async fn execute(&self, command: RemoteCommand) -> NimbusResult<RemoteOutput> {
        let script_path = self.config.script_dir.join(command.script.file_name());
        let body = tokio::fs::read(&script_path).await.map_err(|e| {
            NimbusError::configuration(
                "remote.script_dir",
                format!("cannot read {}: {}", script_path.display(), e),
            )
        })?;

        debug!("Running {} with {} args", command.script, command.args.len());
        let start = Instant::now();

        let mut child = Command::new(&self.config.runner)
            .args(self.runner_args(&command))
            .env(PASSWORD_ENV, command.host.credentials.password.expose())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
        }

        let output = tokio::time::timeout(self.config.script_timeout, child.wait_with_output())
            .await
            .map_err(|_| NimbusError::Timeout {
                operation: command.script.file_name(),
                duration: self.config.script_timeout,
            })??;

        let result = RemoteOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        };

        if result.success {
            info!("Script completed in {:?}", result.duration);
        } else {
            error!(
                status = ?output.status.code(),
                stderr = %result.stderr.trim(),
                "Script failed after {:?}",
                result.duration
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Script;
    use crate::types::{HostAccess, HostCredentials, Secret};

    fn command(args: &[&str]) -> RemoteCommand {
        RemoteCommand::new(
            HostAccess {
                hostname: "h1".to_string(),
                address: "10.0.0.1".to_string(),
                credentials: HostCredentials {
                    user: "root".to_string(),
                    password: Secret::new("pw"),
                    host_key: "ssh-ed25519 AAAA".to_string(),
                    port: 2222,
                },
            },
            Script::GuestCheck,
            args.iter().copied(),
        )
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_runner_args_target_host() {
        let executor = ProcessRemoteExecutor::new(RemoteConfig::default());
        let args = executor.runner_args(&command(&["web 1", "60"]));
        assert_eq!(args[..2], ["-e".to_string(), "ssh".to_string()]);
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"root@10.0.0.1".to_string()));
        assert_eq!(args.last().unwrap(), "bash -s -- 'web 1' '60'");
    }

    #[test]
    fn test_known_hosts_entry_is_quoted() {
        let executor = ProcessRemoteExecutor::new(RemoteConfig::default());
        let args = executor.runner_args(&command(&[]));
        assert!(args.contains(
            &"KnownHostsCommand=/bin/echo '[10.0.0.1]:2222' 'ssh-ed25519 AAAA'".to_string()
        ));
        assert_eq!(known_hosts_name("10.0.0.1", 22), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_missing_script_is_configuration_error() {
        let config = RemoteConfig {
            script_dir: tempfile::tempdir().unwrap().path().to_path_buf(),
            ..Default::default()
        };
        let executor = ProcessRemoteExecutor::new(config);
        let err = executor.execute(command(&[])).await.unwrap_err();
        assert!(matches!(err, NimbusError::ConfigurationError { .. }));
    }
}

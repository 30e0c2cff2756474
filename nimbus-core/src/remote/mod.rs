//! Remote script execution on hypervisor hosts
//!
//! Every host side effect goes through [`RemoteExecutor`]: a named script,
//! the host to run it on and its positional arguments. Transport failures
//! are errors. A script that runs and exits non-zero is a normal
//! [`RemoteOutput`] with `success == false`, so workflows decide what a
//! failure means for them.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{NimbusError, NimbusResult};
use crate::types::{Host, HostAccess};

pub mod process;
pub mod scripts;

pub use process::ProcessRemoteExecutor;
pub use scripts::Script;

/// A single script run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub host: HostAccess,
    pub script: Script,
    pub args: Vec<String>,
}

impl RemoteCommand {
    pub fn new<I, S>(host: HostAccess, script: Script, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host,
            script,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Captured result of a script run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RemoteOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Turn a failed run into an error carrying its output
    pub fn into_result(self, command: &RemoteCommand) -> NimbusResult<RemoteOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(NimbusError::remote(
                command.script.file_name(),
                &command.host.hostname,
                self.stdout,
                self.stderr,
            ))
        }
    }
}

/// Runs host-side scripts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, command: RemoteCommand) -> NimbusResult<RemoteOutput>;
}

/// Run `script` on `host`, turning a non-zero exit into [`NimbusError::RemoteExecution`]
pub async fn run_on_host<I, S>(
    executor: &dyn RemoteExecutor,
    host: &Host,
    script: Script,
    args: I,
) -> NimbusResult<RemoteOutput>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let command = RemoteCommand::new(host.access(), script, args);
    executor.execute(command.clone()).await?.into_result(&command)
}

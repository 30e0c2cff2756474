//! Command dispatcher
//!
//! Routes `{command, args...}` to a workflow through a registry that is
//! built and validated once. Every dispatch gets its own request context, a
//! duplicate check and a wall-clock budget. When the budget runs out the
//! caller gets a failure, but the workflow keeps running in its task and may
//! still change hosts and the store afterwards.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::types::Role;
use crate::workflows::{CommandResult, Orchestrator};

mod commands;

/// Error text of a command that ran out of time
pub const TIMEOUT_MESSAGE: &str = "Command timed out.";

/// Typed entry point of one command
pub type Handler =
    for<'a> fn(&'a Orchestrator, &'a RequestContext, Vec<String>) -> BoxFuture<'a, CommandResult>;

/// Positional command arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    values: Vec<String>,
}

impl Args {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    /// Argument `index`, trimmed, `None` when missing or blank
    pub fn opt(&self, index: usize) -> Option<&str> {
        self.values
            .get(index)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, index: usize, name: &str) -> NimbusResult<&str> {
        self.opt(index)
            .ok_or_else(|| NimbusError::validation(name, "is required"))
    }

    pub fn parse<T>(&self, index: usize, name: &str) -> NimbusResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.opt(index)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| NimbusError::validation(name, format!("'{}': {}", raw, e)))
            })
            .transpose()
    }

    pub fn parse_required<T>(&self, index: usize, name: &str) -> NimbusResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.parse(index, name)?
            .ok_or_else(|| NimbusError::validation(name, "is required"))
    }

    /// `true` only for a literal `true`
    pub fn flag(&self, index: usize) -> bool {
        self.opt(index)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One registered command
#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    /// Whether the command acts inside an active project
    pub requires_project: bool,
    pub handler: Handler,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("requires_project", &self.requires_project)
            .finish()
    }
}

/// Command name to handler map
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Command) -> NimbusResult<()> {
        if self.commands.contains_key(command.name) {
            return Err(NimbusError::configuration(
                "dispatcher",
                format!("command {} registered twice", command.name),
            ));
        }
        self.commands.insert(command.name, command);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

static REGISTRY: Lazy<NimbusResult<CommandRegistry>> = Lazy::new(commands::registry);

/// Every built-in command
pub fn registry() -> NimbusResult<&'static CommandRegistry> {
    REGISTRY
        .as_ref()
        .map_err(|e| NimbusError::configuration("dispatcher", e.to_string()))
}

/// Who is calling, as established by the caller context provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
    pub org: String,
    /// Active project; commands that need one fail without it
    pub project: Option<String>,
    /// Bootstrap of an empty cloud
    pub setup: bool,
}

impl Caller {
    fn context(&self, requires_project: bool) -> NimbusResult<RequestContext> {
        let mut ctx = match (requires_project, self.project.as_deref()) {
            (true, Some(project)) => RequestContext::new(&self.user_id, self.role, &self.org, project)?,
            (true, None) => {
                return Err(NimbusError::validation("project", "command needs an active project"))
            }
            (false, _) => RequestContext::without_project(&self.user_id, self.role, &self.org)?,
        };
        ctx.setup = self.setup;
        Ok(ctx)
    }
}

fn fingerprint(caller: &Caller, command: &str, args: &[String]) -> String {
    let mut hasher = Sha256::new();
    for part in [
        caller.user_id.as_str(),
        caller.org.as_str(),
        caller.project.as_deref().unwrap_or(""),
        command,
    ]
    .into_iter()
    .chain(args.iter().map(String::as_str))
    {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Drops the in-flight marker of a request when its workflow finishes
struct InFlight {
    recent: Arc<DashMap<String, Instant>>,
    /// Fingerprint and the instant it was marked
    key: Option<(String, Instant)>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // A marker swept by the window may have been taken by a newer request
        if let Some((key, marked)) = self.key.take() {
            self.recent.remove_if(&key, |_, seen| *seen == marked);
        }
    }
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    registry: &'static CommandRegistry,
    config: DispatcherConfig,
    /// Requests in flight, by fingerprint
    recent: Arc<DashMap<String, Instant>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> NimbusResult<Self> {
        let config = orchestrator.config().dispatcher.clone();
        Ok(Self {
            orchestrator,
            registry: registry()?,
            config,
            recent: Arc::new(DashMap::new()),
        })
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.registry
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run one command and shape its outcome as a [`CommandResult`]
    pub async fn dispatch(&self, caller: &Caller, command: &str, args: Vec<String>) -> CommandResult {
        let request_id = Uuid::new_v4();
        let span = info_span!("command", %request_id, command, user = %caller.user_id);
        self.dispatch_inner(caller, command, args)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(&self, caller: &Caller, command: &str, args: Vec<String>) -> CommandResult {
        let Some(entry) = self.registry.get(command).copied() else {
            warn!("Unknown command");
            return NimbusError::UnknownCommand {
                command: command.to_string(),
            }
            .into();
        };
        let ctx = match caller.context(entry.requires_project) {
            Ok(ctx) => ctx,
            Err(e) => return e.into(),
        };

        let in_flight = match self.mark_in_flight(caller, command, &args) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("{}", e);
                return e.into();
            }
        };

        let orchestrator = self.orchestrator.clone();
        let handler = entry.handler;
        // The marker stays with the workflow, which may outlive a timeout
        let task = tokio::spawn(
            async move {
                let _in_flight = in_flight;
                handler(orchestrator.as_ref(), &ctx, args).await
            }
            .in_current_span(),
        );

        let started = Instant::now();
        match tokio::time::timeout(self.config.command_timeout, task).await {
            Ok(Ok(result)) => {
                debug!(ok = result.result, elapsed = ?started.elapsed(), "Command finished");
                result
            }
            Ok(Err(e)) => {
                error!("Command task failed: {}", e);
                NimbusError::from(e).into()
            }
            Err(_) => {
                error!(timeout = ?self.config.command_timeout, "Command timed out, its workflow keeps running");
                CommandResult::failed(TIMEOUT_MESSAGE)
            }
        }
    }

    fn mark_in_flight(&self, caller: &Caller, command: &str, args: &[String]) -> NimbusResult<InFlight> {
        if !self.config.duplicate_check_enabled {
            return Ok(InFlight {
                recent: self.recent.clone(),
                key: None,
            });
        }
        let window = self.config.duplicate_check_window;
        self.recent.retain(|_, seen| seen.elapsed() < window);

        let key = fingerprint(caller, command, args);
        match self.recent.entry(key.clone()) {
            Entry::Occupied(_) => Err(NimbusError::DuplicateRequest {
                command: command.to_string(),
            }),
            Entry::Vacant(slot) => {
                let marked = Instant::now();
                slot.insert(marked);
                Ok(InFlight {
                    recent: self.recent.clone(),
                    key: Some((key, marked)),
                })
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commands", &self.registry.len())
            .field("in_flight", &self.recent.len())
            .finish_non_exhaustive()
    }
}

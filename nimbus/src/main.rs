use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use nimbus_core::dispatcher::registry;
use nimbus_core::remote::ProcessRemoteExecutor;
use nimbus_core::types::Role;
use nimbus_core::{Caller, Dispatcher, NimbusConfig, Orchestrator, RequestContext, ResourceStore};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Multi-tenant hybrid-cloud control plane", long_about = None)]
struct Cli {
    /// TOML configuration file; the environment is used when absent
    #[arg(long, env = "NIMBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Calling user (email)
    #[arg(long, env = "NIMBUS_USER")]
    user: Option<String>,

    /// Org of the caller; taken from the user record when known
    #[arg(long, env = "NIMBUS_ORG")]
    org: Option<String>,

    /// Active project
    #[arg(long, env = "NIMBUS_PROJECT")]
    project: Option<String>,

    /// Bootstrap an empty cloud: the calling user becomes its first cloud admin
    #[arg(long)]
    setup: bool,

    /// List the available commands and exit
    #[arg(long)]
    list: bool,

    /// Command to run, e.g. createVM
    command: Option<String>,

    /// Positional command arguments
    args: Vec<String>,
}

/// Resolve who is calling from the user table
async fn caller(cli: &Cli, store: &ResourceStore, user_id: &str) -> Result<Caller> {
    let lookup_org = cli.org.as_deref().unwrap_or("nimbus");
    let lookup = RequestContext::without_project(user_id, Role::User, lookup_org)?;

    let (role, org) = match store.get_user(&lookup, user_id).await? {
        Some(user) => (user.role, user.org),
        None if cli.setup => {
            let Some(org) = cli.org.clone() else {
                bail!("--org is required to bootstrap a cloud");
            };
            (Role::CloudAdmin, org)
        }
        None => bail!("unknown user {}", user_id),
    };

    Ok(Caller {
        user_id: user_id.to_string(),
        role,
        org,
        project: cli.project.clone(),
        setup: cli.setup,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nimbus=info,nimbus_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.list {
        for name in registry()?.names() {
            println!("{}", name);
        }
        return Ok(());
    }
    let Some(command) = cli.command.clone() else {
        bail!("no command given, see --list");
    };
    let Some(user_id) = cli.user.clone() else {
        bail!("--user (or NIMBUS_USER) is required");
    };

    let config = match &cli.config {
        Some(path) => NimbusConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NimbusConfig::from_env()?,
    };

    let store = Arc::new(ResourceStore::open(&config)?);
    let executor = Arc::new(ProcessRemoteExecutor::new(config.remote.clone()));
    let caller = caller(&cli, &store, &user_id).await?;
    tracing::debug!(user = %caller.user_id, role = %caller.role, org = %caller.org, "Resolved caller");

    let orchestrator = Arc::new(Orchestrator::new(config, store, executor));
    let dispatcher = Dispatcher::new(orchestrator.clone())?;
    let result = dispatcher.dispatch(&caller, &command, cli.args.clone()).await;
    // Let background network rollbacks finish before the process exits
    orchestrator.settle().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.result {
        std::process::exit(1);
    }
    Ok(())
}

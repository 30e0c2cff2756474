//! Provisioning workflow orchestrator
//!
//! Each workflow is a fixed sequence of store calls and host-side scripts.
//! Steps run strictly one after another. Steps that change a host or the
//! store register an undo with a [`Saga`]; the first failing step unwinds
//! the ones before it and its own error is what the caller sees.
//!
//! Nothing here holds a lock across steps. Two callers driving the same VM
//! or network at once are not serialised.

use std::sync::Arc;

use crate::config::NimbusConfig;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::host_chooser::HostChooser;
use crate::remote::{run_on_host, RemoteExecutor, RemoteOutput, Script};
use crate::storage::ResourceStore;
use crate::types::{FirewallRuleset, Host, ScopedId, Vm, Vnet};
use crate::vnet::VnetManager;

pub mod firewall;
pub mod hosts;
pub mod ip;
pub mod network;
pub mod result;
pub mod saga;
pub mod tenancy;
pub mod vm;

pub use firewall::FirewallTarget;
pub use ip::{IpAssignment, PublicIpRequest};
pub use result::{CommandResult, UNAUTHORIZED_MESSAGE};
pub use saga::Saga;
pub use vm::{CreateVmRequest, VmSummary};

/// Entry point for every workflow
pub struct Orchestrator {
    config: Arc<NimbusConfig>,
    store: Arc<ResourceStore>,
    executor: Arc<dyn RemoteExecutor>,
    chooser: HostChooser,
    vnets: VnetManager,
}

impl Orchestrator {
    pub fn new(
        config: NimbusConfig,
        store: Arc<ResourceStore>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let chooser = HostChooser::new(store.clone(), config.placement.clone());
        let vnets = VnetManager::new(
            store.clone(),
            executor.clone(),
            config.provisioning.first_vnet_number,
        );
        Self {
            config: Arc::new(config),
            store,
            executor,
            chooser,
            vnets,
        }
    }

    pub fn config(&self) -> &NimbusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn chooser(&self) -> &HostChooser {
        &self.chooser
    }

    pub fn vnets(&self) -> &VnetManager {
        &self.vnets
    }

    /// Run a script and fail on a non-zero exit
    pub(crate) async fn run<I, S>(&self, host: &Host, script: Script, args: I) -> NimbusResult<RemoteOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        run_on_host(self.executor.as_ref(), host, script, args).await
    }

    pub(crate) async fn host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<Host> {
        self.store
            .get_host(ctx, hostname)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("host {}", hostname)))
    }

    pub(crate) async fn vm(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<Vm> {
        self.store
            .get_vm(ctx, id)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("VM {}", id)))
    }

    pub(crate) async fn vnet(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<Vnet> {
        self.store
            .get_vnet(ctx, id)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("vnet {}", id)))
    }

    pub(crate) async fn ruleset(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<FirewallRuleset> {
        self.store
            .get_ruleset(ctx, id)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("firewall ruleset {}", id)))
    }

    /// Wait for background rollbacks to finish
    pub async fn settle(&self) {
        self.vnets.settle().await;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("vnets", &self.vnets)
            .finish_non_exhaustive()
    }
}

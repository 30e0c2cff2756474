//! Host chooser
//!
//! Picks the hypervisor a new VM lands on. The choice is a pure read of the
//! store: the host with the most free vCPUs after oversubscription wins,
//! ties broken by free memory and then by hostname. Disk is not scored.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PlacementConfig;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::storage::{CapacityRequest, ResourceStore};
use crate::types::Host;

/// What a VM needs from its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub architecture: String,
}

#[derive(Debug, Clone)]
pub struct HostChooser {
    store: Arc<ResourceStore>,
    config: PlacementConfig,
}

impl HostChooser {
    pub fn new(store: Arc<ResourceStore>, config: PlacementConfig) -> Self {
        Self { store, config }
    }

    /// Best host for `request`, or `None` when no host has room
    pub async fn host_for(
        &self,
        ctx: &RequestContext,
        request: &PlacementRequest,
    ) -> NimbusResult<Option<Host>> {
        if request.architecture.trim().is_empty() {
            return Err(NimbusError::validation("architecture", "must not be empty"));
        }
        let capacity = CapacityRequest {
            vcpus: request.vcpus,
            memory_mb: request.memory_mb,
            architecture: request.architecture.clone(),
        };
        let host = self
            .store
            .get_available_host(ctx, &capacity, &self.config)
            .await?;
        match &host {
            Some(host) => info!(
                host = %host.hostname,
                vcpus = request.vcpus,
                memory_mb = request.memory_mb,
                "Placement decided"
            ),
            None => warn!(
                vcpus = request.vcpus,
                memory_mb = request.memory_mb,
                architecture = %request.architecture,
                "No host can take the placement"
            ),
        }
        Ok(host)
    }

    /// Host for a new VM: an explicit choice from a cloud admin, otherwise the chooser's pick
    ///
    /// A hostname named by anyone else is ignored.
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        request: &PlacementRequest,
        explicit: Option<&str>,
    ) -> NimbusResult<Option<Host>> {
        match explicit.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hostname) if ctx.is_cloud_admin() => self.store.get_host(ctx, hostname).await,
            _ => self.host_for(ctx, request).await,
        }
    }
}

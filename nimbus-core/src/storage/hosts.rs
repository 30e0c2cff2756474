//! Host and host resource catalog
//!
//! Hosts and images are cloud-global. Only cloud admins edit them; any
//! project may look them up for placement.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::{ResourceStore, StoreOp, Table};
use crate::config::PlacementConfig;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{normalize_name, Host, HostResource, Secret, Vm};

const MIB: u64 = 1024 * 1024;

/// Capacity a placement asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityRequest {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub architecture: String,
}

/// Host with what is left after oversubscription
#[derive(Debug, Clone, PartialEq)]
struct ScoredHost {
    host: Host,
    free_cpu: f64,
    free_ram: f64,
}

impl ResourceStore {
    fn seal_host(&self, host: &Host) -> NimbusResult<Host> {
        let mut sealed = host.clone();
        sealed.credentials.password =
            Secret::new(self.cipher().seal(host.credentials.password.expose())?);
        Ok(sealed)
    }

    fn open_host(&self, mut host: Host) -> NimbusResult<Host> {
        host.credentials.password =
            Secret::new(self.cipher().open(host.credentials.password.expose())?);
        Ok(host)
    }

    async fn stored_hosts(&self) -> NimbusResult<Vec<Host>> {
        self.load_prefix(Table::Hosts, "").await
    }

    pub async fn add_or_update_host(&self, ctx: &RequestContext, host: &Host) -> NimbusResult<()> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        if host.hostname.trim().is_empty() {
            return Err(NimbusError::validation("hostname", "must not be empty"));
        }
        let mut sealed = self.seal_host(host)?;
        sealed.org = host
            .org
            .as_deref()
            .filter(|org| !org.trim().is_empty())
            .map(normalize_name)
            .transpose()?;
        self.save(Table::Hosts, &host.hostname, &sealed).await
    }

    pub async fn delete_host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        self.backend()
            .execute(StoreOp::delete(Table::Hosts, hostname))
            .await
    }

    /// Full host entry with its password in plain text
    pub async fn get_host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<Option<Host>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        match self.load::<Host>(Table::Hosts, hostname).await? {
            Some(host) => Ok(Some(self.open_host(host)?)),
            None => Ok(None),
        }
    }

    pub async fn list_hosts(&self, ctx: &RequestContext) -> NimbusResult<Vec<Host>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        self.stored_hosts()
            .await?
            .into_iter()
            .map(|host| self.open_host(host))
            .collect()
    }

    pub async fn hosts_matching_arch(
        &self,
        ctx: &RequestContext,
        architecture: &str,
    ) -> NimbusResult<Vec<Host>> {
        self.authorize(ctx, ActionCategory::LookupCloudResource).await?;
        self.stored_hosts()
            .await?
            .into_iter()
            .filter(|host| host.architecture.eq_ignore_ascii_case(architecture.trim()))
            .map(|host| self.open_host(host))
            .collect()
    }

    pub async fn update_host_sync_time(
        &self,
        ctx: &RequestContext,
        hostname: &str,
        at: DateTime<Utc>,
    ) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        match self.load::<Host>(Table::Hosts, hostname).await? {
            Some(mut host) => {
                host.last_sync = Some(at);
                self.save(Table::Hosts, hostname, &host).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Best host for a placement, or `None` when nothing fits
    ///
    /// Free capacity is `physical × factor − Σ allocated` for both CPU and
    /// memory. An org holding any reserved host only lands on its own hosts;
    /// everyone else shares the unreserved pool. The winner has the most free
    /// CPU, then the most free memory. Nothing is reserved, so two callers
    /// reading at the same time can both pick the same host.
    pub async fn get_available_host(
        &self,
        ctx: &RequestContext,
        request: &CapacityRequest,
        placement: &PlacementConfig,
    ) -> NimbusResult<Option<Host>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;

        let wanted_ram = request
            .memory_mb
            .checked_mul(MIB)
            .ok_or_else(|| NimbusError::validation("memory", "too large"))?;

        let hosts = self.stored_hosts().await?;
        let vms: Vec<Vm> = self.load_prefix(Table::Vms, "").await?;

        let mut allocated: HashMap<&str, (u64, u64)> = HashMap::new();
        for vm in &vms {
            let used = allocated.entry(vm.hostname.as_str()).or_insert((0, 0));
            used.0 = used.0.saturating_add(u64::from(vm.cpus));
            used.1 = used.1.saturating_add(vm.memory_mb.saturating_mul(MIB));
        }

        let reserved_for_caller =
            |host: &Host| host.org.as_deref().map_or(false, |org| org.eq_ignore_ascii_case(&ctx.org));
        let org_reserves_hosts = hosts.iter().any(|host| reserved_for_caller(host));

        let mut candidates: Vec<ScoredHost> = hosts
            .iter()
            .filter(|host| {
                if org_reserves_hosts {
                    reserved_for_caller(*host)
                } else {
                    host.org.is_none()
                }
            })
            .filter(|host| host.architecture.eq_ignore_ascii_case(request.architecture.trim()))
            .map(|host| {
                let (cpu_used, ram_used) = allocated
                    .get(host.hostname.as_str())
                    .copied()
                    .unwrap_or((0, 0));
                ScoredHost {
                    free_cpu: f64::from(host.capacity.cores) * placement.vcpu_to_physical_cpu_factor
                        - cpu_used as f64,
                    free_ram: host.capacity.memory_bytes as f64
                        * placement.vmem_to_physical_mem_factor
                        - ram_used as f64,
                    host: host.clone(),
                }
            })
            .filter(|scored| {
                scored.free_cpu >= f64::from(request.vcpus)
                    && scored.free_ram >= wanted_ram as f64
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.free_cpu
                .total_cmp(&a.free_cpu)
                .then(b.free_ram.total_cmp(&a.free_ram))
                .then_with(|| a.host.hostname.cmp(&b.host.hostname))
        });

        match candidates.into_iter().next() {
            Some(best) => {
                debug!(
                    host = %best.host.hostname,
                    free_cpu = best.free_cpu,
                    free_ram = best.free_ram,
                    "Selected host"
                );
                Ok(Some(self.open_host(best.host)?))
            }
            None => Ok(None),
        }
    }

    pub async fn add_or_update_host_resource(
        &self,
        ctx: &RequestContext,
        resource: &HostResource,
    ) -> NimbusResult<()> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        if resource.name.trim().is_empty() {
            return Err(NimbusError::validation("name", "must not be empty"));
        }
        self.save(Table::HostResources, &resource.name, resource).await
    }

    pub async fn get_host_resource(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> NimbusResult<Option<HostResource>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        self.load(Table::HostResources, name).await
    }

    pub async fn list_host_resources(
        &self,
        ctx: &RequestContext,
        resource_type: Option<&str>,
    ) -> NimbusResult<Vec<HostResource>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        let resources: Vec<HostResource> = self.load_prefix(Table::HostResources, "").await?;
        Ok(resources
            .into_iter()
            .filter(|r| resource_type.map_or(true, |t| r.resource_type.eq_ignore_ascii_case(t)))
            .collect())
    }

    pub async fn delete_host_resource(&self, ctx: &RequestContext, name: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        self.backend()
            .execute(StoreOp::delete(Table::HostResources, name))
            .await
    }
}

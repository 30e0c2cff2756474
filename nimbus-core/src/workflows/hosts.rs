//! Host catalog workflows

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{info, instrument};

use super::Orchestrator;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::types::{Host, HostResource, VtepHost};

/// Addresses spanned by `range`; `None` when it does not fit in a u128
fn range_size(range: &IpNet) -> Option<u128> {
    1u128.checked_shl(u32::from(range.max_prefix_len() - range.prefix_len()))
}

impl Orchestrator {
    #[instrument(skip(self, ctx, host), fields(user = %ctx.user_id, host = %host.hostname))]
    pub async fn add_host(&self, ctx: &RequestContext, host: &Host) -> NimbusResult<()> {
        self.store.add_or_update_host(ctx, host).await?;
        info!(
            cores = host.capacity.cores,
            memory_bytes = host.capacity.memory_bytes,
            architecture = %host.architecture,
            "Added host"
        );
        Ok(())
    }

    /// Remove a host that no VM runs on
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn delete_host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<bool> {
        let vms = self.store.vms_on_host(ctx, hostname).await?;
        if !vms.is_empty() {
            let names: Vec<String> = vms.iter().map(|vm| vm.id.to_string()).collect();
            return Err(NimbusError::in_use(format!("host {}", hostname), names.join(", ")));
        }
        self.store.delete_host(ctx, hostname).await
    }

    pub async fn update_host_synctime(
        &self,
        ctx: &RequestContext,
        hostname: &str,
        at: Option<DateTime<Utc>>,
    ) -> NimbusResult<()> {
        if !self
            .store
            .update_host_sync_time(ctx, hostname, at.unwrap_or_else(Utc::now))
            .await?
        {
            return Err(NimbusError::not_found(format!("host {}", hostname)));
        }
        Ok(())
    }

    pub async fn get_hosts_matching_arch(&self, ctx: &RequestContext, architecture: &str) -> NimbusResult<Vec<Host>> {
        self.store.hosts_matching_arch(ctx, architecture).await
    }

    pub async fn add_host_resource(&self, ctx: &RequestContext, resource: &HostResource) -> NimbusResult<()> {
        self.store.add_or_update_host_resource(ctx, resource).await?;
        info!(resource = %resource.name, "Added host resource");
        Ok(())
    }

    pub async fn get_host_resource(&self, ctx: &RequestContext, name: &str) -> NimbusResult<HostResource> {
        self.store
            .get_host_resource(ctx, name)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("host resource {}", name)))
    }

    pub async fn list_host_resources(
        &self,
        ctx: &RequestContext,
        resource_type: Option<&str>,
    ) -> NimbusResult<Vec<HostResource>> {
        self.store.list_host_resources(ctx, resource_type).await
    }

    /// Add one address or a CIDR range to the public IP pool
    ///
    /// `hostname` is the terminating host, or `*` for whichever host runs
    /// the VM. Returns how many addresses were new.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn add_host_ip(&self, ctx: &RequestContext, hostname: &str, addresses: &str) -> NimbusResult<usize> {
        let vtep: VtepHost = hostname.parse()?;
        if let VtepHost::Host(hostname) = &vtep {
            self.host(ctx, hostname).await?;
        }
        let addresses = addresses.trim();
        let added = if addresses.contains('/') {
            let range: IpNet = addresses
                .parse()
                .map_err(|e| NimbusError::validation("ip", format!("'{}': {}", addresses, e)))?;
            let limit = self.config.provisioning.max_ip_range_hosts;
            if range_size(&range).map_or(true, |size| size > u128::from(limit)) {
                return Err(NimbusError::validation(
                    "ip",
                    format!("range {} is larger than {} addresses", range, limit),
                ));
            }
            self.store.add_ip_range(ctx, range, vtep).await?
        } else {
            let ip: IpAddr = addresses.parse()?;
            usize::from(self.store.add_ip(ctx, ip, vtep).await?)
        };
        info!(addresses, added, "Added IPs to the pool");
        Ok(added)
    }
}

//! Public and private IP workflows
//!
//! Public IPs ride the project's backbone network: the network is grown onto
//! the VM's host and onto the host the address terminates on, the address is
//! routed into the bridge there, and the guest is configured last. Once the
//! pool row is marked allocated the address counts as assigned, even when the
//! guest could not be configured.

use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{error, info, instrument, warn};

use super::Orchestrator;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::remote::Script;
use crate::roles::ActionCategory;
use crate::types::{Host, Vm, Vnet, VtepHost};

/// Parameters of `assignIPToVM`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicIpRequest {
    pub vm: String,
    /// Routing network; the project backbone when unset
    pub vnet: Option<String>,
    pub dns1: Option<String>,
    pub dns2: Option<String>,
    pub mtu: Option<u32>,
}

/// An IP change that went through, possibly with a guest left to fix by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    pub ip: IpAddr,
    pub warning: Option<String>,
}

fn pick<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

impl Orchestrator {
    /// Check that the guest agent inside `vm` answers
    async fn guest_check(&self, host: &Host, vm: &Vm) -> NimbusResult<()> {
        let wait = self
            .config
            .provisioning
            .max_guest_agent_check_wait
            .as_secs()
            .to_string();
        self.run(host, Script::GuestCheck, [vm.id.host_label(), wait])
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(vm = %vm.id, "Guest agent is not running: {}", e);
                e
            })
    }

    async fn vtep_host(&self, ctx: &RequestContext, vtep: &VtepHost, vm_host: &Host) -> NimbusResult<Host> {
        match vtep {
            VtepHost::SameAsVm => Ok(vm_host.clone()),
            VtepHost::Host(hostname) => self.host(ctx, hostname).await,
        }
    }

    /// Give a VM its first public IP
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user_id, vm = %request.vm))]
    pub async fn assign_public_ip(&self, ctx: &RequestContext, request: &PublicIpRequest) -> NimbusResult<IpAssignment> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let backbone = ctx.backbone_vnet_name();
        let vnet_id = ctx.scoped(pick(&request.vnet, &backbone))?;
        let vm = self.vm(ctx, &ctx.scoped(&request.vm)?).await?;
        if !vm.ips.is_empty() {
            return Err(NimbusError::invalid_operation(
                "assign public IP",
                "VM already has a public IP assigned to it",
            ));
        }

        let entry = match self.store.assignable_ip(ctx, Some(&vm.hostname)).await? {
            Some(entry) => entry,
            None => self
                .store
                .assignable_ip(ctx, None)
                .await?
                .ok_or_else(|| NimbusError::ResourceExhausted {
                    resource: "assignable public IPs".to_string(),
                })?,
        };
        let ip = entry.ip;
        let vm_host = self.host(ctx, &vm.hostname).await?;

        self.guest_check(&vm_host, &vm).await?;

        let vtep = self
            .store
            .host_for_ip(ctx, ip, true)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("VTEP host for IP {}", ip)))?;
        let vtep_host = self.vtep_host(ctx, &vtep, &vm_host).await?;

        self.attach_vm(ctx, &vm.id, &vm.hostname, &vnet_id, true)
            .await?;
        if vtep_host.hostname != vm_host.hostname {
            self.vnets.expand(ctx, &vnet_id, &vtep_host, true).await?;
        }
        let vnet = self.vnet(ctx, &vnet_id).await?;

        self.run(
            &vtep_host,
            Script::AssignIpToVxlanBridge,
            [vnet.id.host_label(), vnet.vnet_num.to_string(), ip.to_string()],
        )
        .await?;
        self.store.allocate_ip(ctx, ip, &vm.id).await?;

        let provisioning = &self.config.provisioning;
        let mtu = request.mtu.unwrap_or(provisioning.default_vm_mtu);
        let configured = self
            .run(
                &vm_host,
                Script::AssignVmIpViaVxlan,
                [
                    vm.id.host_label(),
                    vnet.id.host_label(),
                    vnet.vnet_num.to_string(),
                    ip.to_string(),
                    pick(&request.dns1, &provisioning.default_dns1).to_string(),
                    pick(&request.dns2, &provisioning.default_dns2).to_string(),
                    mtu.to_string(),
                ],
            )
            .await;

        let mut ips = vm.ips.clone();
        ips.push(ip);
        self.store.set_vm_ips(ctx, &vm.id, ips).await?;

        let warning = configured.err().map(|e| {
            warn!(ip = %ip, vm = %vm.id, "IP allocated but guest network configuration failed: {}", e);
            format!(
                "IP {} was allocated to VM {}, but configuring the guest network failed; configure it manually",
                ip, vm.raw_name
            )
        });
        info!(ip = %ip, vm = %vm.id, "Assigned public IP");
        Ok(IpAssignment { ip, warning })
    }

    /// Take a public IP away from a VM
    ///
    /// When it was the VM's last IP the VM leaves the routing network first,
    /// and afterwards the network is retracted from hosts that no longer
    /// need it.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn unassign_public_ip(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        ip: IpAddr,
        vnet_name: Option<&str>,
    ) -> NimbusResult<IpAssignment> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let backbone = ctx.backbone_vnet_name();
        let vnet_name = vnet_name
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&backbone);
        let vnet_id = ctx.scoped(vnet_name)?;
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        if !vm.ips.contains(&ip) {
            return Err(NimbusError::invalid_operation(
                "unassign public IP",
                format!("IP {} is not assigned to VM {}", ip, vm.raw_name),
            ));
        }

        let vm_host = self.host(ctx, &vm.hostname).await?;
        let vtep = self
            .store
            .host_for_ip(ctx, ip, false)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("VTEP host for IP {}", ip)))?;
        let vtep_host = self.vtep_host(ctx, &vtep, &vm_host).await?;

        let last = vm.ips.len() == 1;
        if last {
            self.delete_vm_vnet(ctx, vm_name, vnet_name).await?;
        }
        let vnet = self.vnet(ctx, &vnet_id).await?;

        self.run(
            &vtep_host,
            Script::UnassignIpToVxlanBridge,
            [vnet.id.host_label(), vnet.vnet_num.to_string(), ip.to_string()],
        )
        .await?;
        self.store.unallocate_ip(ctx, ip).await?;

        let unconfigured = self
            .run(
                &vm_host,
                Script::UnassignVmIpViaVxlan,
                [
                    vm.id.host_label(),
                    vnet.id.host_label(),
                    vnet.vnet_num.to_string(),
                    ip.to_string(),
                ],
            )
            .await;

        let remaining: Vec<IpAddr> = vm.ips.iter().copied().filter(|held| *held != ip).collect();
        self.store.set_vm_ips(ctx, &vm.id, remaining).await?;

        if last {
            self.retract_unneeded(ctx, &vnet, [&vm_host, &vtep_host]).await;
        }

        let warning = unconfigured.err().map(|e| {
            warn!(ip = %ip, vm = %vm.id, "IP released but guest network cleanup failed: {}", e);
            format!(
                "IP {} was removed from VM {}, but cleaning up the guest network failed",
                ip, vm.raw_name
            )
        });
        info!(ip = %ip, vm = %vm.id, "Unassigned public IP");
        Ok(IpAssignment { ip, warning })
    }

    /// Contract `vnet` from each host nothing on it needs any more
    async fn retract_unneeded<'h>(&self, ctx: &RequestContext, vnet: &Vnet, hosts: impl IntoIterator<Item = &'h Host>) {
        let mut seen = BTreeSet::new();
        for host in hosts {
            if !seen.insert(host.hostname.clone()) {
                continue;
            }
            let result = match self.vnet_needed_on(ctx, vnet, &host.hostname).await {
                Ok(true) => continue,
                Ok(false) => self
                    .vnets
                    .delete_vnet_from_host(ctx, vnet, host, false, false)
                    .await,
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => info!(vnet = %vnet.id, host = %host.hostname, "Retracted vnet from host"),
                Ok(false) => warn!(vnet = %vnet.id, host = %host.hostname, "Vnet retraction failed on host"),
                Err(e) => error!(vnet = %vnet.id, host = %host.hostname, "Vnet retraction failed: {}", e),
            }
        }
    }

    /// Whether a VM on `hostname` is attached to `vnet`, or an allocated IP
    /// routed through `vnet` terminates there
    async fn vnet_needed_on(&self, ctx: &RequestContext, vnet: &Vnet, hostname: &str) -> NimbusResult<bool> {
        for vm_id in self.store.vms_for_vnet(ctx, &vnet.id).await? {
            if let Some(vm) = self.store.get_vm(ctx, &vm_id).await? {
                if vm.hostname == hostname {
                    return Ok(true);
                }
            }
        }
        for entry in self.store.allocated_ips(ctx).await? {
            let terminates_here = match &entry.vtep {
                VtepHost::Host(vtep) => vtep == hostname,
                VtepHost::SameAsVm => match &entry.allocated_to {
                    Some(holder) => self
                        .store
                        .get_vm(ctx, holder)
                        .await?
                        .is_some_and(|vm| vm.hostname == hostname),
                    None => false,
                },
            };
            if terminates_here {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Give a VM an address on one of its private networks
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn assign_vnet_ip(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        ip: IpAddr,
        vnet_name: &str,
        mtu: Option<u32>,
    ) -> NimbusResult<IpAssignment> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        let vnet = self.vnet(ctx, &ctx.scoped(vnet_name)?).await?;
        let held = self.store.vm_vnet_ips(ctx, &vm.id).await?;
        if let Some((_, existing)) = held.iter().find(|(on, _)| *on == vnet.id) {
            return Err(NimbusError::already_exists(format!(
                "IP {} for VM {} on vnet {}",
                existing, vm.id, vnet.id
            )));
        }
        let host = self.host(ctx, &vm.hostname).await?;
        self.guest_check(&host, &vm).await?;

        let mtu = mtu.unwrap_or(self.config.provisioning.default_vm_mtu);
        let configured = self
            .run(
                &host,
                Script::AssignVmIpViaVnet,
                [
                    vm.id.host_label(),
                    vnet.id.host_label(),
                    vnet.vnet_num.to_string(),
                    ip.to_string(),
                    mtu.to_string(),
                ],
            )
            .await;
        let warning = match configured {
            Ok(_) => {
                self.store.add_vm_vnet_ip(ctx, &vm.id, &vnet.id, ip).await?;
                info!(ip = %ip, vm = %vm.id, vnet = %vnet.id, "Assigned vnet IP");
                None
            }
            Err(e) => {
                warn!(ip = %ip, vm = %vm.id, "Configuring the vnet IP in the guest failed: {}", e);
                Some(format!(
                    "Configuring IP {} inside VM {} failed; configure it manually",
                    ip, vm.raw_name
                ))
            }
        };
        Ok(IpAssignment { ip, warning })
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn unassign_vnet_ip(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        ip: IpAddr,
        vnet_name: &str,
    ) -> NimbusResult<IpAssignment> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        let vnet = self.vnet(ctx, &ctx.scoped(vnet_name)?).await?;
        let host = self.host(ctx, &vm.hostname).await?;

        let unconfigured = self
            .run(
                &host,
                Script::UnassignVmIpViaVnet,
                [
                    vm.id.host_label(),
                    vnet.id.host_label(),
                    vnet.vnet_num.to_string(),
                    ip.to_string(),
                ],
            )
            .await;
        let warning = match unconfigured {
            Ok(_) => {
                if !self.store.remove_vm_vnet_ip(ctx, &vm.id, &vnet.id, ip).await? {
                    warn!(ip = %ip, vm = %vm.id, "No recorded vnet IP to remove");
                }
                info!(ip = %ip, vm = %vm.id, vnet = %vnet.id, "Unassigned vnet IP");
                None
            }
            Err(e) => {
                warn!(ip = %ip, vm = %vm.id, "Removing the vnet IP in the guest failed: {}", e);
                Some(format!("Removing IP {} inside VM {} failed", ip, vm.raw_name))
            }
        };
        Ok(IpAssignment { ip, warning })
    }
}

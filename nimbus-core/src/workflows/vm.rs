//! VM lifecycle workflows

use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::{FirewallTarget, Orchestrator, Saga};
use crate::config::{DEFAULT_DISK_NAME, DEFAULT_OS_TYPE, DEFAULT_VM_TYPE};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::host_chooser::PlacementRequest;
use crate::remote::Script;
use crate::roles::ActionCategory;
use crate::storage::vms::VmListFilter;
use crate::types::{Disk, IpEntry, Vm};

/// Everything `createVM` accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub name: String,
    pub description: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Network to attach right after creation, created if missing
    pub vnet: Option<String>,
    pub image: String,
    pub cloud_init: Option<String>,
    /// Replace a same-named VM already present on the host
    pub force_overwrite: bool,
    /// Hot-plug ceiling; ignored unless above `cores`
    pub max_cores: Option<u32>,
    /// Hot-plug ceiling; ignored unless above `memory_mb`
    pub max_memory_mb: Option<u64>,
    pub additional_params: String,
    pub vm_type: Option<String>,
    pub no_qemu_agent: bool,
    /// Host bridge for the NIC; cloud admins only
    pub kvm_network: Option<String>,
    /// Explicit placement; cloud admins only
    pub hostname: Option<String>,
}

/// A VM with what hangs off it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSummary {
    pub vm: Vm,
    pub vnets: Vec<String>,
    /// `{vnet}:{ruleset}` pairs
    pub firewalls: Vec<String>,
    /// `{vnet}:{ip}` pairs
    pub private_ips: Vec<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Orchestrator {
    /// Create a VM on a chosen host and record it
    ///
    /// The host-side VM is deleted again if its row cannot be written. When
    /// the requested network cannot be attached the whole VM is deleted.
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user_id, vm = %request.name))]
    pub async fn create_vm(&self, ctx: &RequestContext, request: &CreateVmRequest) -> NimbusResult<Vm> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let id = ctx.scoped(&request.name)?;
        if self.store.get_vm(ctx, &id).await?.is_some() {
            return Err(NimbusError::already_exists(format!(
                "VM with the name {} for this project",
                request.name
            )));
        }

        let image = self
            .store
            .get_host_resource(ctx, &request.image)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("host resource {}", request.image)))?;

        // Hot-plug ceilings, checked before anything is placed
        let provisioning = &self.config.provisioning;
        let max_cores = match request.max_cores.filter(|max| *max > request.cores) {
            Some(max) => max,
            None => request
                .cores
                .checked_mul(provisioning.max_cores_multiplier)
                .ok_or_else(|| {
                    NimbusError::validation("cores", format!("{} is too large", request.cores))
                })?,
        };
        let max_memory = match request.max_memory_mb.filter(|max| *max > request.memory_mb) {
            Some(max) => max,
            None => request
                .memory_mb
                .checked_mul(u64::from(provisioning.max_memory_multiplier))
                .ok_or_else(|| {
                    NimbusError::validation("memory", format!("{} MB is too large", request.memory_mb))
                })?,
        };

        let placement = PlacementRequest {
            vcpus: request.cores,
            memory_mb: request.memory_mb,
            disk_gb: request.disk_gb,
            architecture: image.architecture.clone(),
        };
        let host = self
            .chooser
            .resolve(ctx, &placement, request.hostname.as_deref())
            .await?
            .ok_or_else(|| NimbusError::SchedulingError {
                message: "Unable to find a suitable host".to_string(),
            })?;

        let os = match image.os_type() {
            Some(os) => os.to_string(),
            None => {
                warn!(image = %image.name, "Image has no OS type, assuming generic Linux");
                DEFAULT_OS_TYPE.to_string()
            }
        };
        let from_cloud_image = image.is_cloud_image();
        if !from_cloud_image {
            warn!(image = %image.name, "Not a cloud capable image, cloud-init data is ignored");
        }

        let kvm_network = match non_empty(&request.kvm_network) {
            Some(network) if ctx.is_cloud_admin() => network.to_string(),
            _ => provisioning.default_host_network.clone(),
        };

        let label = id.host_label();
        let args = vec![
            label.clone(),
            request.description.clone(),
            request.cores.to_string(),
            request.memory_mb.to_string(),
            request.disk_gb.to_string(),
            image.name.clone(),
            image.uri.clone(),
            os.clone(),
            from_cloud_image.to_string(),
            non_empty(&request.cloud_init).unwrap_or("undefined").to_string(),
            ctx.org.clone(),
            ctx.project.clone(),
            request.force_overwrite.to_string(),
            max_cores.to_string(),
            max_memory.to_string(),
            request.additional_params.clone(),
            request.no_qemu_agent.to_string(),
            kvm_network,
        ];
        let creation_cmd = format!("createVM {}", args.join(" "));

        let mut saga = Saga::new("create_vm");
        saga.run("create on host", self.run(&host, Script::CreateVm, args))
            .await?;
        saga.compensate_with("create on host", async {
            self.run(&host, Script::DeleteVm, [label.as_str()])
                .await
                .map(|_| ())
        });

        let vm = Vm {
            id: id.clone(),
            raw_name: request.name.trim().to_string(),
            description: request.description.clone(),
            hostname: host.hostname.clone(),
            os,
            cpus: request.cores,
            memory_mb: request.memory_mb,
            disks: vec![Disk {
                name: DEFAULT_DISK_NAME.to_string(),
                size_gb: request.disk_gb,
            }],
            creation_cmd,
            vm_type: non_empty(&request.vm_type)
                .unwrap_or(DEFAULT_VM_TYPE)
                .to_string(),
            ips: Vec::new(),
        };
        saga.run("record VM", self.store.put_vm(ctx, &vm)).await?;
        saga.complete();
        info!(host = %host.hostname, "VM created");

        if let Some(vnet) = non_empty(&request.vnet) {
            let mut attach = Saga::new("create_vm");
            attach.compensate_with("record VM", async {
                self.delete_vm(ctx, &request.name).await.map(|_| ())
            });
            attach
                .run("attach vnet", self.add_vm_vnet(ctx, &request.name, vnet, true))
                .await?;
            attach.complete();
        }
        Ok(vm)
    }

    /// Tear a VM down and archive its row
    ///
    /// Firewall rulesets come off first and any failure there aborts. Public
    /// IPs are released best-effort. Host membership of the VM's networks is
    /// left alone.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn delete_vm(&self, ctx: &RequestContext, name: &str) -> NimbusResult<Vm> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let id = ctx.scoped(name)?;
        let vm = self.vm(ctx, &id).await?;

        for vnet_id in self.get_vm_vnets(ctx, name).await? {
            for ruleset in self.store.vm_vnet_firewalls(ctx, &id, &vnet_id).await? {
                self.remove_ruleset_from(ctx, &vm, &ruleset, &FirewallTarget::Private(vnet_id.clone()))
                    .await?;
            }
        }
        if !vm.ips.is_empty() {
            let backbone = ctx.backbone_vnet()?;
            for ruleset in self.store.vm_vnet_firewalls(ctx, &id, &backbone).await? {
                self.remove_ruleset_from(ctx, &vm, &ruleset, &FirewallTarget::Public)
                    .await?;
            }
        }

        self.store.remove_all_vm_vnet_ips(ctx, &id).await?;

        for ip in &vm.ips {
            if let Err(e) = self.unassign_public_ip(ctx, name, *ip, None).await {
                warn!(ip = %ip, "Public IP release failed: {}", e);
            }
        }

        let host = self.host(ctx, &vm.hostname).await?;
        self.run(&host, Script::DeleteVm, [id.host_label()]).await?;

        if let Err(e) = self.store.remove_vm_edges(ctx, &id).await {
            error!(vm = %id, "Removing VM relationships failed: {}", e);
        }
        self.store.delete_vm_record(ctx, &vm).await?;
        info!(vm = %id, "VM deleted");
        Ok(vm)
    }

    /// Rename a VM on its host, then move its row
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn rename_vm(
        &self,
        ctx: &RequestContext,
        old_name: &str,
        new_name: &str,
        shutdown_wait: Option<Duration>,
    ) -> NimbusResult<Vm> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let vm = self.vm(ctx, &ctx.scoped(old_name)?).await?;
        let new_id = ctx.scoped(new_name)?;
        if self.store.get_vm(ctx, &new_id).await?.is_some() {
            return Err(NimbusError::already_exists(format!("VM {}", new_id)));
        }
        let host = self.host(ctx, &vm.hostname).await?;

        let wait = shutdown_wait
            .unwrap_or(self.config.provisioning.default_vm_shutdown_wait)
            .as_secs()
            .to_string();
        let old_label = vm.id.host_label();
        let new_label = new_id.host_label();

        let mut saga = Saga::new("rename_vm");
        saga.run(
            "rename on host",
            self.run(
                &host,
                Script::RenameVm,
                [old_label.as_str(), new_label.as_str(), wait.as_str()],
            ),
        )
        .await?;
        saga.compensate_with("rename on host", async {
            self.run(
                &host,
                Script::RenameVm,
                [new_label.as_str(), old_label.as_str(), wait.as_str()],
            )
            .await
            .map(|_| ())
        });

        let renamed = saga
            .run(
                "move record",
                self.store
                    .rename_vm_record(ctx, &vm, &new_id, new_name.trim()),
            )
            .await?;
        saga.complete();
        info!(from = %vm.id, to = %renamed.id, "VM renamed");
        Ok(renamed)
    }

    /// VMs in scope, each with its networks, rulesets and private IPs
    pub async fn list_vms(&self, ctx: &RequestContext, filter: &VmListFilter) -> NimbusResult<Vec<VmSummary>> {
        let vms = self.store.list_vms(ctx, filter).await?;
        let mut summaries = Vec::with_capacity(vms.len());
        for vm in vms {
            let vnets = self
                .store
                .vnets_for_vm(ctx, &vm.id)
                .await?
                .iter()
                .map(ToString::to_string)
                .collect();
            let firewalls = self
                .store
                .vm_firewalls(ctx, &vm.id)
                .await?
                .iter()
                .map(|(vnet, ruleset)| format!("{}:{}", vnet, ruleset))
                .collect();
            let private_ips = self
                .store
                .vm_vnet_ips(ctx, &vm.id)
                .await?
                .iter()
                .map(|(vnet, ip)| format!("{}:{}", vnet, ip))
                .collect();
            summaries.push(VmSummary {
                vm,
                vnets,
                firewalls,
                private_ips,
            });
        }
        Ok(summaries)
    }

    /// Public IPs of one VM, in assignment order
    pub async fn vm_public_ips(&self, ctx: &RequestContext, name: &str) -> NimbusResult<Vec<IpAddr>> {
        let vm = self.vm(ctx, &ctx.scoped(name)?).await?;
        if vm.ips.is_empty() {
            return Err(NimbusError::not_found(format!("assigned IPs of VM {}", vm.id)));
        }
        Ok(vm.ips)
    }

    /// Public IPs held by VMs of the caller's project
    pub async fn list_assigned_ips(&self, ctx: &RequestContext) -> NimbusResult<Vec<IpEntry>> {
        self.store.allocated_ips(ctx).await
    }
}

//! Built-in commands
//!
//! Each handler turns positional arguments into a typed workflow call and
//! shapes the outcome. Argument positions follow the command line surface.

use futures::future::BoxFuture;
use std::net::IpAddr;
use std::time::Duration;

use super::{Args, Command, CommandRegistry};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::storage::vms::VmListFilter;
use crate::types::{Host, HostCapacity, HostCredentials, HostResource, Secret};
use crate::workflows::{CommandResult, CreateVmRequest, IpAssignment, Orchestrator, PublicIpRequest};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const DEFAULT_SSH_PORT: u16 = 22;

macro_rules! command {
    ($name:literal, $requires_project:expr, $workflow:path) => {{
        fn handler<'a>(
            orchestrator: &'a Orchestrator,
            ctx: &'a RequestContext,
            args: Vec<String>,
        ) -> BoxFuture<'a, CommandResult> {
            Box::pin(async move {
                $workflow(orchestrator, ctx, Args::new(args))
                    .await
                    .unwrap_or_else(CommandResult::from)
            })
        }
        Command {
            name: $name,
            requires_project: $requires_project,
            handler,
        }
    }};
}

pub(super) fn registry() -> NimbusResult<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    for command in [
        // VMs
        command!("createVM", true, create_vm),
        command!("deleteVM", true, delete_vm),
        command!("renameVM", true, rename_vm),
        command!("listVMsForOrgOrProject", true, list_vms),
        command!("listAssignedVMIPs", true, list_assigned_ips),
        // Networks
        command!("createVnet", true, create_vnet),
        command!("deleteVnet", true, delete_vnet),
        command!("addVMVnet", true, add_vm_vnet),
        command!("deleteVMVnet", true, delete_vm_vnet),
        command!("getVMVnets", true, get_vm_vnets),
        command!("listVnets", true, list_vnets),
        // IPs
        command!("assignIPToVM", true, assign_public_ip),
        command!("unassignIPToVM", true, unassign_public_ip),
        command!("assignVnetIP", true, assign_vnet_ip),
        command!("unassignVnetIP", true, unassign_vnet_ip),
        // Firewall
        command!("createFirewallRuleset", true, create_firewall_ruleset),
        command!("deleteFirewallRuleset", true, delete_firewall_ruleset),
        command!("getFirewallRuleset", true, get_firewall_ruleset),
        command!("listFirewallRulesets", true, list_firewall_rulesets),
        command!("applyFirewallRuleset", true, apply_firewall_ruleset),
        command!("removeFirewallRuleset", true, remove_firewall_ruleset),
        // Tenancy
        command!("initOrg", false, init_org),
        command!("addProject", true, add_project),
        command!("deleteProject", true, delete_project),
        command!("addUser", false, add_user),
        command!("deleteUser", true, delete_user),
        command!("addUserToProject", true, add_user_to_project),
        command!("deleteUserFromProject", true, delete_user_from_project),
        command!("getUserProjects", false, get_user_projects),
        command!("changeUserRole", false, change_user_role),
        // Host catalog
        command!("addHost", false, add_host),
        command!("deleteHost", false, delete_host),
        command!("updateHostSynctime", true, update_host_synctime),
        command!("getHostsMatchingArch", false, get_hosts_matching_arch),
        command!("addHostResource", false, add_host_resource),
        command!("getHostResource", true, get_host_resource),
        command!("listHostResources", false, list_host_resources),
        command!("addHostIP", false, add_host_ip),
    ] {
        registry.register(command)?;
    }
    Ok(registry)
}

fn scaled(value: u64, unit: u64, field: &str) -> NimbusResult<u64> {
    value
        .checked_mul(unit)
        .ok_or_else(|| NimbusError::validation(field, format!("{} is too large", value)))
}

fn ip_result(action: &str, assignment: IpAssignment) -> CommandResult {
    let result = CommandResult::ok(format!("{} {}", action, assignment.ip))
        .with_data("ip", assignment.ip);
    match assignment.warning {
        Some(warning) => result.with_warning(warning),
        None => result,
    }
}

/// Host entry safe to hand back to a caller
fn redacted(mut host: Host) -> Host {
    host.credentials.password = Secret::default();
    host
}

// VMs

async fn create_vm(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let request = CreateVmRequest {
        name: args.required(0, "name")?.to_string(),
        description: args.opt(1).unwrap_or_default().to_string(),
        cores: args.parse_required(2, "cores")?,
        memory_mb: args.parse_required(3, "memory")?,
        disk_gb: args.parse_required(4, "disk")?,
        vnet: args.opt(5).map(str::to_string),
        image: args.required(6, "image")?.to_string(),
        cloud_init: args.opt(7).map(str::to_string),
        force_overwrite: args.flag(8),
        max_cores: args.parse(9, "max_cores")?,
        max_memory_mb: args.parse(10, "max_memory")?,
        additional_params: args.opt(11).unwrap_or_default().to_string(),
        vm_type: args.opt(12).map(str::to_string),
        no_qemu_agent: args.flag(13),
        kvm_network: args.opt(14).map(str::to_string),
        hostname: args.opt(15).map(str::to_string),
    };
    let vm = o.create_vm(ctx, &request).await?;
    Ok(CommandResult::ok(format!("VM {} created on {}", vm.id, vm.hostname)).with_data("vm", &vm))
}

async fn delete_vm(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let vm = o.delete_vm(ctx, args.required(0, "name")?).await?;
    Ok(CommandResult::ok(format!("VM {} deleted", vm.id)))
}

async fn rename_vm(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let wait = args.parse::<u64>(2, "shutdown_wait")?.map(Duration::from_secs);
    let vm = o
        .rename_vm(ctx, args.required(0, "old_name")?, args.required(1, "new_name")?, wait)
        .await?;
    Ok(CommandResult::ok(format!("VM renamed to {}", vm.id)).with_data("vm", &vm))
}

async fn list_vms(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let filter = VmListFilter {
        org: args.opt(0).map(str::to_string),
        project: args.opt(1).map(str::to_string),
        vm_types: args
            .opt(2)
            .map(|types| types.split(',').map(|t| t.trim().to_string()).collect())
            .unwrap_or_default(),
    };
    let vms = o.list_vms(ctx, &filter).await?;
    Ok(CommandResult::ok(format!("{} VMs", vms.len())).with_data("vms", &vms))
}

async fn list_assigned_ips(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    match args.opt(0) {
        Some(vm) => {
            let ips = o.vm_public_ips(ctx, vm).await?;
            Ok(CommandResult::ok(format!("{} assigned IPs", ips.len())).with_data("ips", &ips))
        }
        None => {
            let entries = o.list_assigned_ips(ctx).await?;
            Ok(CommandResult::ok(format!("{} assigned IPs", entries.len())).with_data("ips", &entries))
        }
    }
}

// Networks

async fn create_vnet(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let vnet = o
        .create_vnet(ctx, args.required(0, "name")?, args.opt(1).unwrap_or_default())
        .await?;
    Ok(CommandResult::ok(format!("Vnet {} created", vnet.id)).with_data("vnet", &vnet))
}

async fn delete_vnet(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let name = args.required(0, "name")?;
    o.delete_vnet(ctx, name).await?;
    Ok(CommandResult::ok(format!("Vnet {} deleted", name)))
}

async fn add_vm_vnet(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let outcome = o
        .add_vm_vnet(ctx, args.required(0, "vm")?, args.required(1, "vnet")?, args.flag(2))
        .await?;
    Ok(CommandResult::ok(format!("VM attached to vnet {}", outcome.vnet().id))
        .with_data("expanded", outcome.was_added()))
}

async fn delete_vm_vnet(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let vnet = args.required(1, "vnet")?;
    o.delete_vm_vnet(ctx, args.required(0, "vm")?, vnet).await?;
    Ok(CommandResult::ok(format!("VM detached from vnet {}", vnet)))
}

async fn get_vm_vnets(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let vnets: Vec<String> = o
        .get_vm_vnets(ctx, args.required(0, "vm")?)
        .await?
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(CommandResult::ok(format!("{} vnets", vnets.len())).with_data("vnets", &vnets))
}

async fn list_vnets(o: &Orchestrator, ctx: &RequestContext, _args: Args) -> NimbusResult<CommandResult> {
    let vnets = o.list_vnets(ctx).await?;
    Ok(CommandResult::ok(format!("{} vnets", vnets.len())).with_data("vnets", &vnets))
}

// IPs

async fn assign_public_ip(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let request = PublicIpRequest {
        vm: args.required(0, "vm")?.to_string(),
        vnet: args.opt(2).map(str::to_string),
        dns1: args.opt(3).map(str::to_string),
        dns2: args.opt(4).map(str::to_string),
        mtu: args.parse(5, "mtu")?,
    };
    Ok(ip_result("Assigned", o.assign_public_ip(ctx, &request).await?))
}

async fn unassign_public_ip(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let ip: IpAddr = args.parse_required(1, "ip")?;
    let assignment = o
        .unassign_public_ip(ctx, args.required(0, "vm")?, ip, args.opt(2))
        .await?;
    Ok(ip_result("Unassigned", assignment))
}

async fn assign_vnet_ip(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let assignment = o
        .assign_vnet_ip(
            ctx,
            args.required(0, "vm")?,
            args.parse_required(1, "ip")?,
            args.required(2, "vnet")?,
            args.parse(3, "mtu")?,
        )
        .await?;
    Ok(ip_result("Assigned", assignment))
}

async fn unassign_vnet_ip(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let assignment = o
        .unassign_vnet_ip(
            ctx,
            args.required(0, "vm")?,
            args.parse_required(1, "ip")?,
            args.required(2, "vnet")?,
        )
        .await?;
    Ok(ip_result("Unassigned", assignment))
}

// Firewall

async fn create_firewall_ruleset(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let force = args.flag(3);
    let ruleset = o
        .create_firewall_ruleset(
            ctx,
            args.required(0, "name")?,
            args.opt(1).unwrap_or_default(),
            args.required(2, "rules")?,
            force,
        )
        .await?;
    let action = if force { "Updated" } else { "Added" };
    Ok(CommandResult::ok(format!("{} ruleset {}", action, ruleset.id)))
}

async fn delete_firewall_ruleset(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let name = args.required(0, "name")?;
    if o.delete_firewall_ruleset(ctx, name).await? {
        Ok(CommandResult::ok(format!("Deleted ruleset {}", name)))
    } else {
        Ok(CommandResult::ok("").with_warning(format!("Firewall ruleset {} does not exist", name)))
    }
}

async fn get_firewall_ruleset(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let ruleset = o.get_firewall_ruleset(ctx, args.required(0, "name")?).await?;
    let rules: serde_json::Value = serde_json::from_str(ruleset.rules_json())?;
    Ok(CommandResult::ok(ruleset.description.clone()).with_data("ruleset", rules))
}

async fn list_firewall_rulesets(o: &Orchestrator, ctx: &RequestContext, _args: Args) -> NimbusResult<CommandResult> {
    let rulesets: Vec<serde_json::Value> = o
        .list_firewall_rulesets(ctx)
        .await?
        .iter()
        .map(|ruleset| {
            serde_json::json!({
                "name": ruleset.id.name(),
                "description": ruleset.description,
            })
        })
        .collect();
    Ok(CommandResult::ok(format!("{} rulesets", rulesets.len())).with_data("rulesets", rulesets))
}

async fn apply_firewall_ruleset(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let ruleset = args.required(1, "ruleset")?;
    o.apply_firewall_ruleset(ctx, args.required(0, "vm")?, ruleset, args.opt(2))
        .await?;
    Ok(CommandResult::ok(format!("Applied ruleset {}", ruleset)))
}

async fn remove_firewall_ruleset(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let ruleset = args.required(1, "ruleset")?;
    o.remove_firewall_ruleset(ctx, args.required(0, "vm")?, ruleset, args.opt(2))
        .await?;
    Ok(CommandResult::ok(format!("Removed ruleset {}", ruleset)))
}

// Tenancy

async fn init_org(o: &Orchestrator, ctx: &RequestContext, _args: Args) -> NimbusResult<CommandResult> {
    o.init_org(ctx).await?;
    Ok(CommandResult::ok(format!("Org {} initiated", ctx.org)))
}

async fn add_project(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let name = args.required(0, "name")?;
    if o.add_project(ctx, name, args.opt(1).unwrap_or_default()).await? {
        Ok(CommandResult::ok(format!("Added project {}", name)))
    } else {
        Ok(CommandResult::ok("").with_warning(format!("Project {} already exists", name)))
    }
}

async fn delete_project(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    if !o.delete_project(ctx, args.opt(0), args.opt(1)).await? {
        return Err(NimbusError::not_found(format!(
            "project {}",
            args.opt(0).unwrap_or(&ctx.project)
        )));
    }
    Ok(CommandResult::ok("Project deleted"))
}

async fn add_user(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let user = o
        .add_user(
            ctx,
            args.required(0, "email")?,
            args.opt(1).unwrap_or_default(),
            args.opt(2),
            args.opt(3),
        )
        .await?;
    Ok(CommandResult::ok(format!("Added user {} as {}", user.id, user.role)).with_data("user", &user))
}

async fn delete_user(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let email = args.required(0, "email")?;
    o.delete_user(ctx, email, args.opt(1)).await?;
    Ok(CommandResult::ok(format!("Deleted user {}", email)))
}

async fn add_user_to_project(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let email = args.required(0, "email")?;
    if o.add_user_to_project(ctx, email, args.opt(1)).await? {
        Ok(CommandResult::ok(format!("Added {} to the project", email)))
    } else {
        Ok(CommandResult::ok("").with_warning(format!("User {} already belongs to the project", email)))
    }
}

async fn delete_user_from_project(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let email = args.required(0, "email")?;
    if !o
        .delete_user_from_project(ctx, email, args.opt(1), args.opt(2))
        .await?
    {
        return Err(NimbusError::not_found(format!("membership of {}", email)));
    }
    Ok(CommandResult::ok(format!("Removed {} from the project", email)))
}

async fn get_user_projects(o: &Orchestrator, ctx: &RequestContext, _args: Args) -> NimbusResult<CommandResult> {
    let projects = o.get_user_projects(ctx).await?;
    Ok(CommandResult::ok(format!("{} projects", projects.len())).with_data("projects", &projects))
}

async fn change_user_role(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let user = o
        .change_user_role(ctx, args.required(0, "email")?, args.required(1, "role")?)
        .await?;
    Ok(CommandResult::ok(format!("User {} is now {}", user.id, user.role)).with_data("user", &user))
}

// Host catalog

async fn add_host(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let host = Host {
        hostname: args.required(0, "hostname")?.to_string(),
        address: args.required(1, "address")?.to_string(),
        host_type: args.opt(2).unwrap_or("kvm").to_string(),
        credentials: HostCredentials {
            user: args.required(3, "user")?.to_string(),
            password: Secret::new(args.required(4, "password")?),
            host_key: args.required(5, "host_key")?.to_string(),
            port: args.parse(6, "port")?.unwrap_or(DEFAULT_SSH_PORT),
        },
        capacity: HostCapacity {
            cores: args.parse_required(7, "cores")?,
            memory_bytes: scaled(args.parse_required(8, "memory_mb")?, MIB, "memory_mb")?,
            disk_bytes: scaled(args.parse(9, "disk_gb")?.unwrap_or(0), GIB, "disk_gb")?,
            network_speed: args.parse(10, "network_speed")?.unwrap_or(0),
            sockets: args.parse(11, "sockets")?.unwrap_or(1),
        },
        processor: args.opt(12).unwrap_or_default().to_string(),
        architecture: args.required(13, "architecture")?.to_string(),
        org: args.opt(14).map(str::to_string),
        last_sync: None,
    };
    o.add_host(ctx, &host).await?;
    Ok(CommandResult::ok(format!("Added host {}", host.hostname)))
}

async fn delete_host(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let hostname = args.required(0, "hostname")?;
    if !o.delete_host(ctx, hostname).await? {
        return Err(NimbusError::not_found(format!("host {}", hostname)));
    }
    Ok(CommandResult::ok(format!("Deleted host {}", hostname)))
}

async fn update_host_synctime(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let hostname = args.required(0, "hostname")?;
    o.update_host_synctime(ctx, hostname, args.parse(1, "at")?)
        .await?;
    Ok(CommandResult::ok(format!("Updated sync time of {}", hostname)))
}

async fn get_hosts_matching_arch(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let hosts: Vec<Host> = o
        .get_hosts_matching_arch(ctx, args.required(0, "architecture")?)
        .await?
        .into_iter()
        .map(redacted)
        .collect();
    Ok(CommandResult::ok(format!("{} hosts", hosts.len())).with_data("hosts", &hosts))
}

async fn add_host_resource(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let resource = HostResource {
        name: args.required(0, "name")?.to_string(),
        uri: args.required(1, "uri")?.to_string(),
        architecture: args.required(2, "architecture")?.to_string(),
        description: args.opt(3).unwrap_or_default().to_string(),
        extra_info: args.opt(4).unwrap_or_default().to_string(),
        resource_type: args.opt(5).unwrap_or("image").to_string(),
    };
    o.add_host_resource(ctx, &resource).await?;
    Ok(CommandResult::ok(format!("Added host resource {}", resource.name)))
}

async fn get_host_resource(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let resource = o.get_host_resource(ctx, args.required(0, "name")?).await?;
    Ok(CommandResult::ok(resource.description.clone()).with_data("resource", &resource))
}

async fn list_host_resources(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let resources = o.list_host_resources(ctx, args.opt(0)).await?;
    Ok(CommandResult::ok(format!("{} host resources", resources.len())).with_data("resources", &resources))
}

async fn add_host_ip(o: &Orchestrator, ctx: &RequestContext, args: Args) -> NimbusResult<CommandResult> {
    let added = o
        .add_host_ip(ctx, args.required(0, "hostname")?, args.required(1, "ip")?)
        .await?;
    Ok(CommandResult::ok(format!("Added {} IPs", added)).with_data("added", added))
}

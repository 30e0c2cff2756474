//! Firewall ruleset workflows

use tracing::{info, instrument, warn};

use super::Orchestrator;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::remote::Script;
use crate::roles::ActionCategory;
use crate::types::{FirewallRuleset, Host, ScopedId, Vm, VtepHost};

/// Where a ruleset is enforced for a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallTarget {
    /// The VM's first public IP, on the host that IP terminates on
    Public,
    /// One of the VM's private networks, on the VM's own host
    Private(ScopedId),
}

impl FirewallTarget {
    /// An empty or missing network name means the public IP
    pub fn resolve(ctx: &RequestContext, vnet: Option<&str>) -> NimbusResult<Self> {
        match vnet.map(str::trim).filter(|v| !v.is_empty()) {
            Some(vnet) => Ok(FirewallTarget::Private(ctx.scoped(vnet)?)),
            None => Ok(FirewallTarget::Public),
        }
    }

    fn vnet_id(&self, ctx: &RequestContext) -> NimbusResult<ScopedId> {
        match self {
            FirewallTarget::Public => ctx.backbone_vnet(),
            FirewallTarget::Private(vnet) => Ok(vnet.clone()),
        }
    }
}

/// Host to run the script on plus its positional arguments
struct Enforcement {
    vnet: ScopedId,
    host: Host,
    script: Script,
    args: Vec<String>,
}

impl Orchestrator {
    pub async fn create_firewall_ruleset(
        &self,
        ctx: &RequestContext,
        name: &str,
        description: &str,
        rules_json: &str,
        force_update: bool,
    ) -> NimbusResult<FirewallRuleset> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let ruleset = FirewallRuleset::new(ctx.scoped(name)?, description, rules_json)?;
        if !force_update && self.store.get_ruleset(ctx, &ruleset.id).await?.is_some() {
            return Err(NimbusError::already_exists(format!(
                "firewall ruleset {}",
                ruleset.id
            )));
        }
        self.store.put_ruleset(ctx, &ruleset).await?;
        info!(ruleset = %ruleset.id, updated = force_update, "Stored firewall ruleset");
        Ok(ruleset)
    }

    /// Delete a ruleset nobody uses; `false` when there was nothing to delete
    pub async fn delete_firewall_ruleset(&self, ctx: &RequestContext, name: &str) -> NimbusResult<bool> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let id = ctx.scoped(name)?;
        if self.store.get_ruleset(ctx, &id).await?.is_none() {
            warn!(ruleset = %id, "Firewall ruleset does not exist");
            return Ok(false);
        }
        let holders = self.store.ruleset_holders(ctx, &id).await?;
        if !holders.is_empty() {
            let names: Vec<String> = holders.iter().map(ToString::to_string).collect();
            return Err(NimbusError::in_use(
                format!("firewall ruleset {}", id),
                names.join(", "),
            ));
        }
        self.store.delete_ruleset(ctx, &id).await
    }

    pub async fn get_firewall_ruleset(&self, ctx: &RequestContext, name: &str) -> NimbusResult<FirewallRuleset> {
        self.ruleset(ctx, &ctx.scoped(name)?).await
    }

    pub async fn list_firewall_rulesets(&self, ctx: &RequestContext) -> NimbusResult<Vec<FirewallRuleset>> {
        self.store.list_rulesets(ctx).await
    }

    /// Push a ruleset to a VM's public IP or one of its networks
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn apply_firewall_ruleset(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        ruleset_name: &str,
        vnet_name: Option<&str>,
    ) -> NimbusResult<()> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let target = FirewallTarget::resolve(ctx, vnet_name)?;
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        let ruleset = self.ruleset(ctx, &ctx.scoped(ruleset_name)?).await?;

        let vnet_id = target.vnet_id(ctx)?;
        let applied = self.store.vm_vnet_firewalls(ctx, &vm.id, &vnet_id).await?;
        if applied.contains(&ruleset.id) {
            return Err(NimbusError::already_exists(format!(
                "firewall ruleset {} on vnet {} of VM {}",
                ruleset.id, vnet_id, vm.id
            )));
        }

        let enforcement = self.enforcement(ctx, &vm, &ruleset, &target, true).await?;
        self.run(&enforcement.host, enforcement.script, enforcement.args)
            .await?;
        self.store
            .add_vm_firewall(ctx, &vm.id, &enforcement.vnet, &ruleset.id)
            .await?;
        info!(vm = %vm.id, ruleset = %ruleset.id, vnet = %enforcement.vnet, "Applied firewall ruleset");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn remove_firewall_ruleset(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        ruleset_name: &str,
        vnet_name: Option<&str>,
    ) -> NimbusResult<()> {
        self.store
            .authorize(ctx, ActionCategory::EditProjectResource)
            .await?;
        let target = FirewallTarget::resolve(ctx, vnet_name)?;
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        self.remove_ruleset_from(ctx, &vm, &ctx.scoped(ruleset_name)?, &target)
            .await
    }

    pub(crate) async fn remove_ruleset_from(
        &self,
        ctx: &RequestContext,
        vm: &Vm,
        ruleset_id: &ScopedId,
        target: &FirewallTarget,
    ) -> NimbusResult<()> {
        let vnet_id = target.vnet_id(ctx)?;
        let applied = self.store.vm_vnet_firewalls(ctx, &vm.id, &vnet_id).await?;
        if !applied.contains(ruleset_id) {
            return Err(NimbusError::invalid_operation(
                "remove firewall ruleset",
                format!("{} is not applied on vnet {} of VM {}", ruleset_id, vnet_id, vm.id),
            ));
        }
        let ruleset = self.ruleset(ctx, ruleset_id).await?;

        let enforcement = self.enforcement(ctx, vm, &ruleset, target, false).await?;
        self.run(&enforcement.host, enforcement.script, enforcement.args)
            .await?;
        self.store
            .remove_vm_firewall(ctx, &vm.id, &enforcement.vnet, &ruleset.id)
            .await?;
        info!(vm = %vm.id, ruleset = %ruleset.id, vnet = %enforcement.vnet, "Removed firewall ruleset");
        Ok(())
    }

    async fn enforcement(
        &self,
        ctx: &RequestContext,
        vm: &Vm,
        ruleset: &FirewallRuleset,
        target: &FirewallTarget,
        apply: bool,
    ) -> NimbusResult<Enforcement> {
        let vnet = self.vnet(ctx, &target.vnet_id(ctx)?).await?;
        let rules = ruleset.reversed_rules_json()?;

        let (host, locator, script) = match target {
            FirewallTarget::Public => {
                let ip = *vm.ips.first().ok_or_else(|| {
                    NimbusError::invalid_operation("firewall ruleset", format!("VM {} has no public IP", vm.id))
                })?;
                let vtep = self
                    .store
                    .host_for_ip(ctx, ip, false)
                    .await?
                    .ok_or_else(|| NimbusError::not_found(format!("VTEP host for IP {}", ip)))?;
                let hostname = match vtep {
                    VtepHost::SameAsVm => vm.hostname.clone(),
                    VtepHost::Host(hostname) => hostname,
                };
                let script = if apply {
                    Script::ApplyFirewallRulesetPublic
                } else {
                    Script::RemoveFirewallRulesetPublic
                };
                (self.host(ctx, &hostname).await?, ip.to_string(), script)
            }
            FirewallTarget::Private(_) => {
                let script = if apply {
                    Script::ApplyFirewallRulesetPrivate
                } else {
                    Script::RemoveFirewallRulesetPrivate
                };
                (
                    self.host(ctx, &vm.hostname).await?,
                    vnet.vnet_num.to_string(),
                    script,
                )
            }
        };

        Ok(Enforcement {
            vnet: vnet.id,
            host,
            script,
            args: vec![rules, locator, vm.id.host_label(), ruleset.id.host_label()],
        })
    }
}

//! Network workflows: networks and VM attachments

use tracing::{error, info, instrument, warn};

use super::Orchestrator;
use crate::context::RequestContext;
use crate::error::NimbusResult;
use crate::remote::Script;
use crate::types::{ScopedId, Vnet};
use crate::vnet::ExpandOutcome;

impl Orchestrator {
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn create_vnet(&self, ctx: &RequestContext, name: &str, description: &str) -> NimbusResult<Vnet> {
        self.vnets.create_vnet(ctx, &ctx.scoped(name)?, description).await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn delete_vnet(&self, ctx: &RequestContext, name: &str) -> NimbusResult<()> {
        self.vnets.delete_vnet(ctx, &ctx.scoped(name)?).await
    }

    pub async fn list_vnets(&self, ctx: &RequestContext) -> NimbusResult<Vec<Vnet>> {
        self.store.list_vnets(ctx).await
    }

    /// Attach a VM to a network, growing the network onto the VM's host first
    ///
    /// When the host-side attach fails and the host only joined the network
    /// for this VM, the host leaves the network again in the background.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn add_vm_vnet(
        &self,
        ctx: &RequestContext,
        vm_name: &str,
        vnet_name: &str,
        create: bool,
    ) -> NimbusResult<ExpandOutcome> {
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        self.attach_vm(ctx, &vm.id, &vm.hostname, &ctx.scoped(vnet_name)?, create)
            .await
    }

    pub(crate) async fn attach_vm(
        &self,
        ctx: &RequestContext,
        vm_id: &ScopedId,
        hostname: &str,
        vnet_id: &ScopedId,
        create: bool,
    ) -> NimbusResult<ExpandOutcome> {
        self.store
            .authorize_scoped(ctx, crate::roles::ActionCategory::EditProjectResource, vm_id)
            .await?;
        let host = self.host(ctx, hostname).await?;
        let outcome = self.vnets.expand(ctx, vnet_id, &host, create).await?;
        let vnet = outcome.vnet();

        let bridge_args = [
            vm_id.host_label(),
            vnet.id.host_label(),
            vnet.vnet_num.to_string(),
        ];
        let attached = self
            .run(&host, Script::AttachVmToVxlanBridge, bridge_args.clone())
            .await;
        if let Err(e) = attached {
            if outcome.was_added() {
                self.vnets.contract_in_background(ctx, vnet, &host);
            }
            return Err(e);
        }

        // An attachment without its edge is invisible to the delete cascades
        if let Err(e) = self.store.add_vnet_vm(ctx, vnet_id, vm_id).await {
            error!(vm = %vm_id, vnet = %vnet_id, "Recording VM attachment failed: {}", e);
            if let Err(detach) = self
                .run(&host, Script::DetachVmFromVxlanBridge, bridge_args)
                .await
            {
                error!(
                    vm = %vm_id,
                    vnet = %vnet_id,
                    "Compensation failed, manual cleanup needed: {}",
                    detach
                );
            }
            if outcome.was_added() {
                self.vnets.contract_in_background(ctx, vnet, &host);
            }
            return Err(e);
        }
        info!(vm = %vm_id, vnet = %vnet_id, "Attached VM to vnet");
        Ok(outcome)
    }

    /// Detach a VM from a network; the host stays a member of the network
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn delete_vm_vnet(&self, ctx: &RequestContext, vm_name: &str, vnet_name: &str) -> NimbusResult<()> {
        let vm = self.vm(ctx, &ctx.scoped(vm_name)?).await?;
        let vnet = self.vnet(ctx, &ctx.scoped(vnet_name)?).await?;
        let host = self.host(ctx, &vm.hostname).await?;

        self.run(
            &host,
            Script::DetachVmFromVxlanBridge,
            [
                vm.id.host_label(),
                vnet.id.host_label(),
                vnet.vnet_num.to_string(),
            ],
        )
        .await?;
        if !self.store.remove_vnet_vm(ctx, &vnet.id, &vm.id).await? {
            warn!(vm = %vm.id, vnet = %vnet.id, "VM had no recorded attachment to the vnet");
        }
        info!(vm = %vm.id, vnet = %vnet.id, "Detached VM from vnet");
        Ok(())
    }

    /// Networks a VM is attached to, without the public IP backbone
    pub async fn get_vm_vnets(&self, ctx: &RequestContext, vm_name: &str) -> NimbusResult<Vec<ScopedId>> {
        let vm_id = ctx.scoped(vm_name)?;
        let backbone = ctx.backbone_vnet()?;
        Ok(self
            .store
            .vnets_for_vm(ctx, &vm_id)
            .await?
            .into_iter()
            .filter(|vnet| vnet != &backbone)
            .collect())
    }
}

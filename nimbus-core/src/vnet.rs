//! Virtual network mesh manager
//!
//! Keeps every overlay network a full mesh across the hosts that carry it.
//! Each member host runs a bridge whose peer list holds the address of every
//! other member. Membership changes push only the delta: a joining host is
//! seeded with the current members, then each member learns the new address.
//! The bridge is configured before the membership edge is recorded, so no
//! host is ever announced as a peer before it is ready.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::remote::{run_on_host, RemoteCommand, RemoteExecutor, RemoteOutput, Script};
use crate::storage::ResourceStore;
use crate::types::{Host, ScopedId, Vnet};

/// Result of growing a network onto a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandOutcome {
    /// The host joined the mesh
    Added(Vnet),
    /// The host was already a member; nothing was pushed
    Exists(Vnet),
}

impl ExpandOutcome {
    pub fn vnet(&self) -> &Vnet {
        match self {
            ExpandOutcome::Added(vnet) | ExpandOutcome::Exists(vnet) => vnet,
        }
    }

    pub fn was_added(&self) -> bool {
        matches!(self, ExpandOutcome::Added(_))
    }
}

#[derive(Clone)]
pub struct VnetManager {
    store: Arc<ResourceStore>,
    executor: Arc<dyn RemoteExecutor>,
    first_vnet_number: u32,
    /// Rollbacks running in the background
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl VnetManager {
    pub fn new(
        store: Arc<ResourceStore>,
        executor: Arc<dyn RemoteExecutor>,
        first_vnet_number: u32,
    ) -> Self {
        Self {
            store,
            executor,
            first_vnet_number,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait for every background rollback started so far
    pub async fn settle(&self) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                error!("Background network rollback panicked: {}", e);
            }
        }
    }

    /// Keep `handle` for `settle`, dropping rollbacks that already ended
    fn track(&self, handle: JoinHandle<()>) {
        let mut background = self.background.lock();
        background.retain(|pending| !pending.is_finished());
        background.push(handle);
    }

    /// Rollback handles held for `settle`
    pub fn tracked_rollbacks(&self) -> usize {
        self.background.lock().len()
    }

    /// Register a network; touches no host
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id, vnet = %id))]
    pub async fn create_vnet(
        &self,
        ctx: &RequestContext,
        id: &ScopedId,
        description: &str,
    ) -> NimbusResult<Vnet> {
        let vnet = self
            .store
            .create_vnet_record(ctx, id, description, self.first_vnet_number)
            .await?
            .ok_or_else(|| NimbusError::already_exists(format!("vnet {}", id)))?;
        info!(vnet_num = vnet.vnet_num, "Created vnet");
        Ok(vnet)
    }

    /// Remove a network from every member host, then drop its row
    ///
    /// Refuses while any VM is attached. Stops at the first host whose
    /// bridge removal fails and keeps the row so the delete can be retried.
    /// A network that is already gone is a no-op.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id, vnet = %id))]
    pub async fn delete_vnet(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<()> {
        let Some(vnet) = self.store.get_vnet(ctx, id).await? else {
            warn!("Vnet does not exist, nothing to delete");
            return Ok(());
        };

        let attached = self.store.vms_for_vnet(ctx, id).await?;
        if !attached.is_empty() {
            return Err(NimbusError::in_use(
                format!("vnet {}", id),
                attached
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        for hostname in self.store.vnet_hosts(ctx, id).await? {
            let host = self.member_host(ctx, &hostname).await?;
            if let Some(output) = self.contract(ctx, &vnet, &host, false, true).await? {
                if !output.success {
                    return Err(NimbusError::remote(
                        Script::DeleteVxlanBridge.file_name(),
                        hostname,
                        output.stdout,
                        output.stderr,
                    ));
                }
            }
        }

        self.store.delete_vnet_record(ctx, id).await?;
        info!("Deleted vnet");
        Ok(())
    }

    /// Make `host` a member of the network's mesh
    ///
    /// A missing network is created when `allow_create` is set. When the
    /// membership edge or any peer update fails, the partial change is rolled
    /// back in the background and the failure is returned.
    #[instrument(skip(self, ctx, host), fields(user = %ctx.user_id, vnet = %id, host = %host.hostname))]
    pub async fn expand(
        &self,
        ctx: &RequestContext,
        id: &ScopedId,
        host: &Host,
        allow_create: bool,
    ) -> NimbusResult<ExpandOutcome> {
        let vnet = match self.store.get_vnet(ctx, id).await? {
            Some(vnet) => vnet,
            None if allow_create => match self
                .store
                .create_vnet_record(ctx, id, "", self.first_vnet_number)
                .await?
            {
                Some(vnet) => vnet,
                // Lost a creation race; the winner's row is as good as ours
                None => self
                    .store
                    .get_vnet(ctx, id)
                    .await?
                    .ok_or_else(|| NimbusError::not_found(format!("vnet {}", id)))?,
            },
            None => return Err(NimbusError::not_found(format!("vnet {}", id))),
        };

        let members = self.store.vnet_hosts(ctx, id).await?;
        if members.iter().any(|member| member == &host.hostname) {
            debug!("Host already carries the vnet");
            return Ok(ExpandOutcome::Exists(vnet));
        }

        let mut peers = Vec::with_capacity(members.len());
        for hostname in &members {
            peers.push(self.member_host(ctx, hostname).await?);
        }
        let peer_addresses = peers
            .iter()
            .map(|peer| peer.address.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let label = vnet.id.host_label();
        let vnet_num = vnet.vnet_num.to_string();
        run_on_host(
            self.executor.as_ref(),
            host,
            Script::AddOrModifyVxlanBridge,
            [
                label.as_str(),
                vnet_num.as_str(),
                peer_addresses.as_str(),
                "auto",
                "auto",
            ],
        )
        .await?;

        if let Err(e) = self.store.add_vnet_host(ctx, id, &host.hostname).await {
            error!("Recording vnet membership failed: {}", e);
            self.spawn_rollback(ctx, &vnet, host, false, Vec::new());
            return Err(e);
        }

        let mut updated = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Err(e) = self.add_peers(&vnet, &peer, &[host.address.as_str()]).await {
                error!(peer = %peer.hostname, "Peer update failed: {}", e);
                self.spawn_rollback(ctx, &vnet, host, true, updated);
                return Err(e);
            }
            updated.push(peer);
        }

        info!(members = members.len() + 1, "Host joined vnet");
        Ok(ExpandOutcome::Added(vnet))
    }

    /// Take `host` out of the network's mesh
    ///
    /// Returns `true` when the host was not a member. Otherwise returns
    /// whether the host-side bridge removal succeeded.
    #[instrument(skip(self, ctx, vnet, host), fields(user = %ctx.user_id, vnet = %vnet.id, host = %host.hostname))]
    pub async fn delete_vnet_from_host(
        &self,
        ctx: &RequestContext,
        vnet: &Vnet,
        host: &Host,
        suppress_db_update: bool,
        suppress_peer_update: bool,
    ) -> NimbusResult<bool> {
        Ok(self
            .contract(ctx, vnet, host, suppress_db_update, suppress_peer_update)
            .await?
            .map_or(true, |output| output.success))
    }

    async fn contract(
        &self,
        ctx: &RequestContext,
        vnet: &Vnet,
        host: &Host,
        suppress_db_update: bool,
        suppress_peer_update: bool,
    ) -> NimbusResult<Option<RemoteOutput>> {
        if !self.store.is_vnet_host(ctx, &vnet.id, &host.hostname).await? {
            return Ok(None);
        }
        if !suppress_db_update {
            self.store
                .remove_vnet_host(ctx, &vnet.id, &host.hostname)
                .await?;
        }

        let command = RemoteCommand::new(
            host.access(),
            Script::DeleteVxlanBridge,
            [vnet.id.host_label(), vnet.vnet_num.to_string()],
        );
        let output = self.executor.execute(command).await?;
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "Bridge removal failed");
            return Ok(Some(output));
        }

        if !suppress_peer_update {
            for hostname in self.store.vnet_hosts(ctx, &vnet.id).await? {
                if hostname == host.hostname {
                    continue;
                }
                let result = match self.member_host(ctx, &hostname).await {
                    Ok(peer) => self
                        .delete_peers(vnet, &peer, &[host.address.as_str()])
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!(peer = %hostname, "Peer removal failed: {}", e);
                }
            }
        }
        Ok(Some(output))
    }

    /// Add peer addresses to the bridge on `host`
    pub async fn add_peers(
        &self,
        vnet: &Vnet,
        host: &Host,
        peers: &[&str],
    ) -> NimbusResult<RemoteOutput> {
        run_on_host(
            self.executor.as_ref(),
            host,
            Script::AddVxlanPeers,
            [vnet.id.host_label(), vnet.vnet_num.to_string(), peers.join(" ")],
        )
        .await
    }

    /// Remove peer addresses from the bridge on `host`
    pub async fn delete_peers(
        &self,
        vnet: &Vnet,
        host: &Host,
        peers: &[&str],
    ) -> NimbusResult<RemoteOutput> {
        run_on_host(
            self.executor.as_ref(),
            host,
            Script::DeleteVxlanPeers,
            [vnet.id.host_label(), vnet.vnet_num.to_string(), peers.join(" ")],
        )
        .await
    }

    async fn member_host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<Host> {
        self.store
            .get_host(ctx, hostname)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("host {}", hostname)))
    }

    /// Take `host` out of the mesh in the background
    pub fn contract_in_background(&self, ctx: &RequestContext, vnet: &Vnet, host: &Host) {
        let manager = self.clone();
        let ctx = ctx.clone();
        let vnet = vnet.clone();
        let host = host.clone();

        let handle = tokio::spawn(async move {
            match manager
                .delete_vnet_from_host(&ctx, &vnet, &host, false, false)
                .await
            {
                Ok(true) => debug!(vnet = %vnet.id, host = %host.hostname, "Contracted vnet"),
                Ok(false) => warn!(vnet = %vnet.id, host = %host.hostname, "Vnet contraction failed on host"),
                Err(e) => error!(vnet = %vnet.id, host = %host.hostname, "Vnet contraction failed: {}", e),
            }
        });
        self.track(handle);
    }

    /// Undo a half-finished expand without making the caller wait
    fn spawn_rollback(
        &self,
        ctx: &RequestContext,
        vnet: &Vnet,
        host: &Host,
        edge_recorded: bool,
        updated_peers: Vec<Host>,
    ) {
        let manager = self.clone();
        let ctx = ctx.clone();
        let vnet = vnet.clone();
        let host = host.clone();

        let handle = tokio::spawn(async move {
            warn!(vnet = %vnet.id, host = %host.hostname, "Rolling back vnet expansion");
            if edge_recorded {
                if let Err(e) = manager
                    .store
                    .remove_vnet_host(&ctx, &vnet.id, &host.hostname)
                    .await
                {
                    error!("Rollback could not drop membership edge: {}", e);
                }
            }
            let bridge = run_on_host(
                manager.executor.as_ref(),
                &host,
                Script::DeleteVxlanBridge,
                [vnet.id.host_label(), vnet.vnet_num.to_string()],
            )
            .await;
            if let Err(e) = bridge {
                error!("Rollback could not remove bridge: {}", e);
            }
            for peer in updated_peers {
                if let Err(e) = manager
                    .delete_peers(&vnet, &peer, &[host.address.as_str()])
                    .await
                {
                    error!(peer = %peer.hostname, "Rollback could not remove peer: {}", e);
                }
            }
        });
        self.track(handle);
    }
}

impl std::fmt::Debug for VnetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VnetManager")
            .field("first_vnet_number", &self.first_vnet_number)
            .finish_non_exhaustive()
    }
}

//! Virtual networks and the relationships graph
//!
//! Edges use storage keys on both ends: a vnet or VM is referenced by its
//! scoped storage key, a host by its hostname and an IP by its text form.

use std::net::IpAddr;

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{RelationKind, Relationship, ScopedId, Vnet};

const VNET_SEQUENCE: &str = "vnet_number";

impl ResourceStore {
    /// Insert a new network with the next free segment number
    ///
    /// Returns `None` when a network with this id already exists.
    pub async fn create_vnet_record(
        &self,
        ctx: &RequestContext,
        id: &ScopedId,
        description: &str,
        first_vnet_number: u32,
    ) -> NimbusResult<Option<Vnet>> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, id)
            .await?;
        if self.load::<Vnet>(Table::Vnets, &id.storage_key()).await?.is_some() {
            return Ok(None);
        }

        let number = self
            .backend()
            .next_sequence(VNET_SEQUENCE, u64::from(first_vnet_number))
            .await?;
        let vnet = Vnet {
            id: id.clone(),
            description: description.to_string(),
            vnet_num: u32::try_from(number).map_err(|_| NimbusError::ResourceExhausted {
                resource: "vnet segment numbers".to_string(),
            })?,
        };

        let inserted = self
            .backend()
            .execute(StoreOp::insert(
                Table::Vnets,
                id.storage_key(),
                Self::encode(&vnet)?,
            ))
            .await?;
        Ok(inserted.then_some(vnet))
    }

    pub async fn get_vnet(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<Option<Vnet>> {
        self.authorize_scoped(ctx, ActionCategory::LookupProjectResource, id)
            .await?;
        self.load(Table::Vnets, &id.storage_key()).await
    }

    pub async fn list_vnets(&self, ctx: &RequestContext) -> NimbusResult<Vec<Vnet>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        self.load_prefix(Table::Vnets, &ScopedId::scope_prefix(&ctx.org, &ctx.project))
            .await
    }

    /// Delete the network row together with any leftover membership edges
    pub async fn delete_vnet_record(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<()> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, id)
            .await?;
        let key = id.storage_key();
        self.commit(
            vec![
                StoreOp::delete(Table::Vnets, key.clone()),
                StoreOp::delete_prefix(
                    Table::Relationships,
                    Relationship::prefix(RelationKind::VnetHost, Some(&key), None),
                ),
            ],
            || NimbusError::internal("vnet delete transaction conflicted"),
        )
        .await
    }

    pub async fn add_relationship(&self, ctx: &RequestContext, edge: &Relationship) -> NimbusResult<()> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        crate::fail_point!(crate::failpoints::STORE_RELATIONSHIP);
        self.save(Table::Relationships, &edge.storage_key(), edge).await
    }

    /// `true` when the edge existed
    pub async fn remove_relationship(&self, ctx: &RequestContext, edge: &Relationship) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        self.backend()
            .execute(StoreOp::delete(Table::Relationships, edge.storage_key()))
            .await
    }

    /// Edges of `kind`, optionally narrowed by `pk1` and then `pk2`
    pub async fn relationships(
        &self,
        ctx: &RequestContext,
        kind: RelationKind,
        pk1: Option<&str>,
        pk2: Option<&str>,
    ) -> NimbusResult<Vec<Relationship>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        self.load_prefix(Table::Relationships, &Relationship::prefix(kind, pk1, pk2))
            .await
    }

    /// Edges of `kind` whose second column is `pk2`
    pub async fn relationships_to(
        &self,
        ctx: &RequestContext,
        kind: RelationKind,
        pk2: &str,
    ) -> NimbusResult<Vec<Relationship>> {
        Ok(self
            .relationships(ctx, kind, None, None)
            .await?
            .into_iter()
            .filter(|edge| edge.pk2 == pk2)
            .collect())
    }

    // Network ↔ host membership

    pub async fn vnet_hosts(&self, ctx: &RequestContext, vnet: &ScopedId) -> NimbusResult<Vec<String>> {
        Ok(self
            .relationships(ctx, RelationKind::VnetHost, Some(&vnet.storage_key()), None)
            .await?
            .into_iter()
            .map(|edge| edge.pk2)
            .collect())
    }

    pub async fn is_vnet_host(&self, ctx: &RequestContext, vnet: &ScopedId, hostname: &str) -> NimbusResult<bool> {
        Ok(!self
            .relationships(
                ctx,
                RelationKind::VnetHost,
                Some(&vnet.storage_key()),
                Some(hostname),
            )
            .await?
            .is_empty())
    }

    pub async fn add_vnet_host(&self, ctx: &RequestContext, vnet: &ScopedId, hostname: &str) -> NimbusResult<()> {
        self.add_relationship(
            ctx,
            &Relationship::new(RelationKind::VnetHost, vnet.storage_key(), hostname),
        )
        .await
    }

    pub async fn remove_vnet_host(&self, ctx: &RequestContext, vnet: &ScopedId, hostname: &str) -> NimbusResult<bool> {
        self.remove_relationship(
            ctx,
            &Relationship::new(RelationKind::VnetHost, vnet.storage_key(), hostname),
        )
        .await
    }

    // Network ↔ VM attachment

    pub async fn add_vnet_vm(&self, ctx: &RequestContext, vnet: &ScopedId, vm: &ScopedId) -> NimbusResult<()> {
        self.add_relationship(
            ctx,
            &Relationship::new(RelationKind::VnetVm, vnet.storage_key(), vm.storage_key()),
        )
        .await
    }

    pub async fn remove_vnet_vm(&self, ctx: &RequestContext, vnet: &ScopedId, vm: &ScopedId) -> NimbusResult<bool> {
        self.remove_relationship(
            ctx,
            &Relationship::new(RelationKind::VnetVm, vnet.storage_key(), vm.storage_key()),
        )
        .await
    }

    pub async fn vnets_for_vm(&self, ctx: &RequestContext, vm: &ScopedId) -> NimbusResult<Vec<ScopedId>> {
        self.relationships_to(ctx, RelationKind::VnetVm, &vm.storage_key())
            .await?
            .iter()
            .map(|edge| ScopedId::from_storage_key(&edge.pk1))
            .collect()
    }

    pub async fn vms_for_vnet(&self, ctx: &RequestContext, vnet: &ScopedId) -> NimbusResult<Vec<ScopedId>> {
        self.relationships(ctx, RelationKind::VnetVm, Some(&vnet.storage_key()), None)
            .await?
            .iter()
            .map(|edge| ScopedId::from_storage_key(&edge.pk2))
            .collect()
    }

    // VM ↔ network ↔ private IP

    pub async fn add_vm_vnet_ip(
        &self,
        ctx: &RequestContext,
        vm: &ScopedId,
        vnet: &ScopedId,
        ip: IpAddr,
    ) -> NimbusResult<()> {
        self.add_relationship(ctx, &vm_vnet_ip_edge(vm, vnet, ip)).await
    }

    pub async fn remove_vm_vnet_ip(
        &self,
        ctx: &RequestContext,
        vm: &ScopedId,
        vnet: &ScopedId,
        ip: IpAddr,
    ) -> NimbusResult<bool> {
        self.remove_relationship(ctx, &vm_vnet_ip_edge(vm, vnet, ip)).await
    }

    /// Private IPs of a VM, per network
    pub async fn vm_vnet_ips(&self, ctx: &RequestContext, vm: &ScopedId) -> NimbusResult<Vec<(ScopedId, IpAddr)>> {
        let edges = self
            .relationships(ctx, RelationKind::VmVnetIp, Some(&vm.storage_key()), None)
            .await?;
        let mut ips = Vec::with_capacity(edges.len());
        for edge in edges {
            let ip = edge
                .pk3
                .as_deref()
                .ok_or_else(|| NimbusError::internal("vmvnetip edge without an IP"))?
                .parse::<IpAddr>()?;
            ips.push((ScopedId::from_storage_key(&edge.pk2)?, ip));
        }
        Ok(ips)
    }

    pub async fn remove_all_vm_vnet_ips(&self, ctx: &RequestContext, vm: &ScopedId) -> NimbusResult<bool> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, vm)
            .await?;
        self.backend()
            .execute(StoreOp::delete_prefix(
                Table::Relationships,
                Relationship::prefix(RelationKind::VmVnetIp, Some(&vm.storage_key()), None),
            ))
            .await
    }

    // VM ↔ network ↔ firewall ruleset

    pub async fn add_vm_firewall(
        &self,
        ctx: &RequestContext,
        vm: &ScopedId,
        vnet: &ScopedId,
        ruleset: &ScopedId,
    ) -> NimbusResult<()> {
        self.add_relationship(ctx, &vm_firewall_edge(vm, vnet, ruleset))
            .await
    }

    pub async fn remove_vm_firewall(
        &self,
        ctx: &RequestContext,
        vm: &ScopedId,
        vnet: &ScopedId,
        ruleset: &ScopedId,
    ) -> NimbusResult<bool> {
        self.remove_relationship(ctx, &vm_firewall_edge(vm, vnet, ruleset))
            .await
    }

    /// Rulesets applied to a VM on one network
    pub async fn vm_vnet_firewalls(
        &self,
        ctx: &RequestContext,
        vm: &ScopedId,
        vnet: &ScopedId,
    ) -> NimbusResult<Vec<ScopedId>> {
        self.relationships(
            ctx,
            RelationKind::VmVnetFirewall,
            Some(&vm.storage_key()),
            Some(&vnet.storage_key()),
        )
        .await?
        .iter()
        .filter_map(|edge| edge.pk3.as_deref())
        .map(ScopedId::from_storage_key)
        .collect()
    }

    /// Every ruleset applied to a VM, with the network it applies on
    pub async fn vm_firewalls(&self, ctx: &RequestContext, vm: &ScopedId) -> NimbusResult<Vec<(ScopedId, ScopedId)>> {
        let edges = self
            .relationships(ctx, RelationKind::VmVnetFirewall, Some(&vm.storage_key()), None)
            .await?;
        let mut applied = Vec::with_capacity(edges.len());
        for edge in edges {
            if let Some(ruleset) = edge.pk3.as_deref() {
                applied.push((
                    ScopedId::from_storage_key(&edge.pk2)?,
                    ScopedId::from_storage_key(ruleset)?,
                ));
            }
        }
        Ok(applied)
    }

    /// VMs a ruleset is applied to
    pub async fn ruleset_holders(&self, ctx: &RequestContext, ruleset: &ScopedId) -> NimbusResult<Vec<ScopedId>> {
        let key = ruleset.storage_key();
        self.relationships(ctx, RelationKind::VmVnetFirewall, None, None)
            .await?
            .iter()
            .filter(|edge| edge.pk3.as_deref() == Some(key.as_str()))
            .map(|edge| ScopedId::from_storage_key(&edge.pk1))
            .collect()
    }

    /// Drop every VM-keyed edge left behind by a deleted VM
    pub async fn remove_vm_edges(&self, ctx: &RequestContext, vm: &ScopedId) -> NimbusResult<()> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, vm)
            .await?;
        let key = vm.storage_key();
        let mut ops = vec![
            StoreOp::delete_prefix(
                Table::Relationships,
                Relationship::prefix(RelationKind::VmVnetIp, Some(&key), None),
            ),
            StoreOp::delete_prefix(
                Table::Relationships,
                Relationship::prefix(RelationKind::VmVnetFirewall, Some(&key), None),
            ),
        ];
        for edge in self.relationships_to(ctx, RelationKind::VnetVm, &key).await? {
            ops.push(StoreOp::delete(Table::Relationships, edge.storage_key()));
        }
        self.commit(ops, || NimbusError::internal("VM edge cleanup conflicted"))
            .await
    }
}

fn vm_vnet_ip_edge(vm: &ScopedId, vnet: &ScopedId, ip: IpAddr) -> Relationship {
    Relationship::new(RelationKind::VmVnetIp, vm.storage_key(), vnet.storage_key())
        .with_pk3(ip.to_string())
}

fn vm_firewall_edge(vm: &ScopedId, vnet: &ScopedId, ruleset: &ScopedId) -> Relationship {
    Relationship::new(
        RelationKind::VmVnetFirewall,
        vm.storage_key(),
        vnet.storage_key(),
    )
    .with_pk3(ruleset.storage_key())
}

//! Public IP pool

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{IpEntry, ScopedId, VtepHost};

impl ResourceStore {
    async fn stored_ips(&self) -> NimbusResult<Vec<IpEntry>> {
        self.load_prefix(Table::Ip, "").await
    }

    /// Add one address to the pool; `false` when it is already there
    pub async fn add_ip(&self, ctx: &RequestContext, ip: IpAddr, vtep: VtepHost) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        let entry = IpEntry {
            ip,
            vtep,
            allocated_to: None,
        };
        self.backend()
            .execute(StoreOp::insert(Table::Ip, ip.to_string(), Self::encode(&entry)?))
            .await
    }

    /// Add every host address of a range in one transaction; returns how many were new
    ///
    /// Addresses already in the pool are left as they are.
    pub async fn add_ip_range(&self, ctx: &RequestContext, range: IpNet, vtep: VtepHost) -> NimbusResult<usize> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        let known: HashSet<IpAddr> = self
            .stored_ips()
            .await?
            .into_iter()
            .map(|entry| entry.ip)
            .collect();

        let mut ops = Vec::new();
        for ip in range.hosts().filter(|ip| !known.contains(ip)) {
            let entry = IpEntry {
                ip,
                vtep: vtep.clone(),
                allocated_to: None,
            };
            ops.push(StoreOp::insert(Table::Ip, ip.to_string(), Self::encode(&entry)?));
        }
        let added = ops.len();
        if added > 0 {
            self.commit(ops, || {
                NimbusError::already_exists(format!("an address of {} added concurrently", range))
            })
            .await?;
        }
        Ok(added)
    }

    /// Remove a free address from the pool
    pub async fn delete_ip(&self, ctx: &RequestContext, ip: IpAddr) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        if let Some(entry) = self.load::<IpEntry>(Table::Ip, &ip.to_string()).await? {
            if let Some(holder) = entry.allocated_to {
                return Err(NimbusError::in_use(format!("IP {}", ip), holder.to_string()));
            }
        }
        self.backend()
            .execute(StoreOp::delete(Table::Ip, ip.to_string()))
            .await
    }

    pub async fn get_ip(&self, ctx: &RequestContext, ip: IpAddr) -> NimbusResult<Option<IpEntry>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        self.load(Table::Ip, &ip.to_string()).await
    }

    pub async fn list_ips(&self, ctx: &RequestContext) -> NimbusResult<Vec<IpEntry>> {
        self.authorize(ctx, ActionCategory::LookupCloudResource).await?;
        self.stored_ips().await
    }

    /// Terminating host of an address
    ///
    /// With `for_allocation` only a free address answers.
    pub async fn host_for_ip(
        &self,
        ctx: &RequestContext,
        ip: IpAddr,
        for_allocation: bool,
    ) -> NimbusResult<Option<VtepHost>> {
        Ok(self
            .get_ip(ctx, ip)
            .await?
            .filter(|entry| !for_allocation || entry.is_free())
            .map(|entry| entry.vtep))
    }

    /// First free address terminating on `hostname`, or on any host when none is given
    pub async fn assignable_ip(&self, ctx: &RequestContext, hostname: Option<&str>) -> NimbusResult<Option<IpEntry>> {
        self.authorize(ctx, ActionCategory::LookupCloudResourceForProject)
            .await?;
        Ok(self.stored_ips().await?.into_iter().find(|entry| {
            entry.is_free()
                && match hostname {
                    Some(hostname) => entry.vtep == VtepHost::Host(hostname.to_string()),
                    None => true,
                }
        }))
    }

    /// Mark an address as held by `vm`
    pub async fn allocate_ip(&self, ctx: &RequestContext, ip: IpAddr, vm: &ScopedId) -> NimbusResult<IpEntry> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, vm)
            .await?;
        let mut entry = self
            .load::<IpEntry>(Table::Ip, &ip.to_string())
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("IP {}", ip)))?;
        match &entry.allocated_to {
            Some(holder) if holder != vm => {
                return Err(NimbusError::in_use(format!("IP {}", ip), holder.to_string()));
            }
            Some(_) => return Ok(entry),
            None => {}
        }
        entry.allocated_to = Some(vm.clone());
        self.save(Table::Ip, &ip.to_string(), &entry).await?;
        Ok(entry)
    }

    /// Return an address to the pool
    pub async fn unallocate_ip(&self, ctx: &RequestContext, ip: IpAddr) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let Some(mut entry) = self.load::<IpEntry>(Table::Ip, &ip.to_string()).await? else {
            return Ok(false);
        };
        if let Some(holder) = &entry.allocated_to {
            self.check_scope(ctx, holder)?;
        }
        entry.allocated_to = None;
        self.save(Table::Ip, &ip.to_string(), &entry).await?;
        Ok(true)
    }

    /// Addresses held by VMs of the caller's project
    pub async fn allocated_ips(&self, ctx: &RequestContext) -> NimbusResult<Vec<IpEntry>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        Ok(self
            .stored_ips()
            .await?
            .into_iter()
            .filter(|entry| {
                entry
                    .allocated_to
                    .as_ref()
                    .is_some_and(|vm| vm.org() == ctx.org && vm.project() == ctx.project)
            })
            .collect())
    }
}

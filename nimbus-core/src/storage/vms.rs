//! VM rows

use rand::Rng;
use std::net::IpAddr;

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{IpEntry, RecycleBinEntry, RelationKind, Relationship, ScopedId, Snapshot, Vm};

/// Which VMs a listing covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmListFilter {
    pub org: Option<String>,
    pub project: Option<String>,
    /// VM types to include; empty means only plain `vm`, `*` means all
    pub vm_types: Vec<String>,
}

impl ResourceStore {
    pub async fn put_vm(&self, ctx: &RequestContext, vm: &Vm) -> NimbusResult<()> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, &vm.id)
            .await?;
        self.save(Table::Vms, &vm.id.storage_key(), vm).await
    }

    pub async fn get_vm(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<Option<Vm>> {
        self.authorize_scoped(ctx, ActionCategory::LookupProjectResource, id)
            .await?;
        self.load(Table::Vms, &id.storage_key()).await
    }

    /// VMs of a project, or of a whole org for admins that name no project
    pub async fn list_vms(&self, ctx: &RequestContext, filter: &VmListFilter) -> NimbusResult<Vec<Vm>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;

        let org = self.enforcer().normalized_org(ctx, filter.org.as_deref())?;
        let prefix = match filter.project.as_deref() {
            Some(project) => {
                let project = self.enforcer().normalized_project(ctx, Some(project))?;
                ScopedId::scope_prefix(&org, &project)
            }
            None if ctx.is_cloud_admin() || ctx.is_org_admin() => ScopedId::org_prefix(&org),
            None => ScopedId::scope_prefix(&org, &ctx.project),
        };

        let all_types = filter.vm_types.iter().any(|t| t.trim() == "*");
        let vms: Vec<Vm> = self.load_prefix(Table::Vms, &prefix).await?;
        Ok(vms
            .into_iter()
            .filter(|vm| {
                all_types
                    || (filter.vm_types.is_empty() && vm.vm_type == crate::config::DEFAULT_VM_TYPE)
                    || filter
                        .vm_types
                        .iter()
                        .any(|t| t.trim().eq_ignore_ascii_case(&vm.vm_type))
            })
            .collect())
    }

    /// VMs placed on a host, across every tenant
    pub async fn vms_on_host(&self, ctx: &RequestContext, hostname: &str) -> NimbusResult<Vec<Vm>> {
        self.authorize(ctx, ActionCategory::LookupCloudResource).await?;
        let vms: Vec<Vm> = self.load_prefix(Table::Vms, "").await?;
        Ok(vms.into_iter().filter(|vm| vm.hostname == hostname).collect())
    }

    pub async fn update_vm_host(
        &self,
        ctx: &RequestContext,
        id: &ScopedId,
        hostname: &str,
    ) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditCloudResource).await?;
        match self.load::<Vm>(Table::Vms, &id.storage_key()).await? {
            Some(mut vm) => {
                vm.hostname = hostname.to_string();
                self.save(Table::Vms, &id.storage_key(), &vm).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn recycle_entry(vm: &Vm) -> NimbusResult<RecycleBinEntry> {
        let stamp = format!(
            "{}{}",
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen_range(0..1_000_000u32)
        );
        Ok(RecycleBinEntry {
            org: vm.id.org().to_string(),
            project: vm.id.project().to_string(),
            object_id: vm.id.name().to_string(),
            stamp,
            object_json: serde_json::to_string(vm)?,
        })
    }

    /// Archive `vm` to the recycle bin and delete its row, in one transaction
    pub async fn delete_vm_record(&self, ctx: &RequestContext, vm: &Vm) -> NimbusResult<()> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, &vm.id)
            .await?;
        let archived = Self::recycle_entry(vm)?;
        let key = archived.storage_key();
        let archive_id = archived.id();
        self.commit(
            vec![
                StoreOp::insert(Table::RecycleBin, key, Self::encode(&archived)?),
                StoreOp::delete(Table::Vms, vm.id.storage_key()),
            ],
            || NimbusError::already_exists(format!("recycle bin entry {}", archive_id)),
        )
        .await
    }

    /// Move a VM row to a new id, carrying its edges and IP allocations along
    ///
    /// Adds the new row, repoints every relationship and IP, then archives
    /// and deletes the old row, all in one transaction.
    pub async fn rename_vm_record(
        &self,
        ctx: &RequestContext,
        vm: &Vm,
        new_id: &ScopedId,
        new_raw_name: &str,
    ) -> NimbusResult<Vm> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, &vm.id)
            .await?;
        self.check_scope(ctx, new_id)?;

        let old_key = vm.id.storage_key();
        let new_key = new_id.storage_key();

        let mut renamed = vm.clone();
        renamed.id = new_id.clone();
        renamed.raw_name = new_raw_name.to_string();

        let mut ops = vec![StoreOp::insert(
            Table::Vms,
            new_key.clone(),
            Self::encode(&renamed)?,
        )];

        let edges: Vec<Relationship> = self.load_prefix(Table::Relationships, "").await?;
        for edge in edges {
            let mut moved = edge.clone();
            match edge.kind {
                RelationKind::VnetVm if edge.pk2 == old_key => {
                    moved.pk2 = new_key.clone();
                }
                // Snapshot rows are keyed by their resource and move with it
                RelationKind::Snapshot if edge.pk2 == old_key => {
                    if let Some(mut snapshot) = self.load::<Snapshot>(Table::Snapshots, &edge.pk1).await? {
                        snapshot.resource_id = new_key.clone();
                        ops.push(StoreOp::delete(Table::Snapshots, edge.pk1.clone()));
                        ops.push(StoreOp::put(
                            Table::Snapshots,
                            snapshot.key(),
                            Self::encode(&snapshot)?,
                        ));
                        moved.pk1 = snapshot.key();
                    }
                    moved.pk2 = new_key.clone();
                }
                RelationKind::VmVnetIp | RelationKind::VmVnetFirewall if edge.pk1 == old_key => {
                    moved.pk1 = new_key.clone();
                }
                _ => continue,
            }
            ops.push(StoreOp::delete(Table::Relationships, edge.storage_key()));
            ops.push(StoreOp::put(
                Table::Relationships,
                moved.storage_key(),
                Self::encode(&moved)?,
            ));
        }

        let ips: Vec<IpEntry> = self.load_prefix(Table::Ip, "").await?;
        for mut entry in ips {
            if entry.allocated_to.as_ref() == Some(&vm.id) {
                entry.allocated_to = Some(new_id.clone());
                ops.push(StoreOp::put(
                    Table::Ip,
                    entry.ip.to_string(),
                    Self::encode(&entry)?,
                ));
            }
        }

        let archived = Self::recycle_entry(vm)?;
        ops.push(StoreOp::insert(
            Table::RecycleBin,
            archived.storage_key(),
            Self::encode(&archived)?,
        ));
        ops.push(StoreOp::delete(Table::Vms, old_key));

        self.commit(ops, || NimbusError::already_exists(format!("VM {}", new_id)))
            .await?;
        Ok(renamed)
    }

    /// Record the public IPs a VM answers on
    pub async fn set_vm_ips(
        &self,
        ctx: &RequestContext,
        id: &ScopedId,
        ips: Vec<IpAddr>,
    ) -> NimbusResult<Vm> {
        let mut vm = self
            .get_vm(ctx, id)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("VM {}", id)))?;
        vm.ips = ips;
        self.put_vm(ctx, &vm).await?;
        Ok(vm)
    }
}

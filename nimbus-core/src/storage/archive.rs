//! Recycle bin and snapshot catalog

use chrono::Utc;

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{RecycleBinEntry, RelationKind, Relationship, Snapshot, KEY_SEPARATOR};

impl ResourceStore {
    pub async fn add_to_recycle_bin(&self, ctx: &RequestContext, entry: &RecycleBinEntry) -> NimbusResult<()> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        self.check_project(ctx, &entry.org, &entry.project)?;
        let inserted = self
            .backend()
            .execute(StoreOp::insert(
                Table::RecycleBin,
                entry.storage_key(),
                Self::encode(entry)?,
            ))
            .await?;
        if !inserted {
            return Err(NimbusError::already_exists(format!("recycle bin entry {}", entry.id())));
        }
        Ok(())
    }

    /// Archived copies of an object, oldest first; `stamp` narrows to one copy
    pub async fn recycled_objects(
        &self,
        ctx: &RequestContext,
        object_id: &str,
        stamp: Option<&str>,
    ) -> NimbusResult<Vec<RecycleBinEntry>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        let prefix = format!(
            "{}{}",
            RecycleBinEntry::object_prefix(&ctx.org, &ctx.project, object_id),
            KEY_SEPARATOR
        );
        let entries: Vec<RecycleBinEntry> = self.load_prefix(Table::RecycleBin, &prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| stamp.map_or(true, |stamp| entry.stamp == stamp))
            .collect())
    }

    /// Purge every archived copy of an object
    pub async fn purge_recycled_objects(&self, ctx: &RequestContext, object_id: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        self.backend()
            .execute(StoreOp::delete_prefix(
                Table::RecycleBin,
                format!(
                    "{}{}",
                    RecycleBinEntry::object_prefix(&ctx.org, &ctx.project, object_id),
                    KEY_SEPARATOR
                ),
            ))
            .await
    }

    /// Record a snapshot of a resource in the caller's project
    pub async fn add_snapshot(
        &self,
        ctx: &RequestContext,
        resource_id: &str,
        name: &str,
        extra_info: &str,
    ) -> NimbusResult<Snapshot> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let snapshot = Snapshot {
            org: ctx.org.clone(),
            project: ctx.project.clone(),
            resource_id: resource_id.to_string(),
            name: crate::types::normalize_name(name)?,
            extra_info: extra_info.to_string(),
            created_at: Utc::now(),
        };
        let key = snapshot.key();
        let edge = Relationship::new(RelationKind::Snapshot, key.clone(), resource_id);
        self.commit(
            vec![
                StoreOp::insert(Table::Snapshots, key.clone(), Self::encode(&snapshot)?),
                StoreOp::put(Table::Relationships, edge.storage_key(), Self::encode(&edge)?),
            ],
            || NimbusError::already_exists(format!("snapshot {} of {}", snapshot.name, resource_id)),
        )
        .await?;
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, ctx: &RequestContext, resource_id: &str, name: &str) -> NimbusResult<Option<Snapshot>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        let name = crate::types::normalize_name(name)?;
        self.load(
            Table::Snapshots,
            &Snapshot::storage_key(&ctx.org, &ctx.project, resource_id, &name),
        )
        .await
    }

    /// Snapshots of one resource, following the snapshot edges
    pub async fn snapshots_for_resource(&self, ctx: &RequestContext, resource_id: &str) -> NimbusResult<Vec<Snapshot>> {
        let edges = self
            .relationships_to(ctx, RelationKind::Snapshot, resource_id)
            .await?;
        let mut snapshots = Vec::with_capacity(edges.len());
        for edge in edges {
            if let Some(snapshot) = self.load::<Snapshot>(Table::Snapshots, &edge.pk1).await? {
                if snapshot.org == ctx.org && snapshot.project == ctx.project {
                    snapshots.push(snapshot);
                }
            }
        }
        Ok(snapshots)
    }

    pub async fn delete_snapshot(&self, ctx: &RequestContext, resource_id: &str, name: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let name = crate::types::normalize_name(name)?;
        let key = Snapshot::storage_key(&ctx.org, &ctx.project, resource_id, &name);
        if self.load::<Snapshot>(Table::Snapshots, &key).await?.is_none() {
            return Ok(false);
        }
        let edge = Relationship::new(RelationKind::Snapshot, key.clone(), resource_id);
        self.commit(
            vec![
                StoreOp::delete(Table::Snapshots, key),
                StoreOp::delete(Table::Relationships, edge.storage_key()),
            ],
            || NimbusError::internal("snapshot delete transaction conflicted"),
        )
        .await?;
        Ok(true)
    }

    /// Drop every snapshot of a resource; returns how many went away
    pub async fn delete_all_snapshots(&self, ctx: &RequestContext, resource_id: &str) -> NimbusResult<usize> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let snapshots = self.snapshots_for_resource(ctx, resource_id).await?;
        let mut ops = Vec::with_capacity(snapshots.len() * 2);
        for snapshot in &snapshots {
            let key = snapshot.key();
            let edge = Relationship::new(RelationKind::Snapshot, key.clone(), resource_id);
            ops.push(StoreOp::delete(Table::Snapshots, key));
            ops.push(StoreOp::delete(Table::Relationships, edge.storage_key()));
        }
        self.commit(ops, || NimbusError::internal("snapshot purge transaction conflicted"))
            .await?;
        Ok(snapshots.len())
    }

    fn check_project(&self, ctx: &RequestContext, org: &str, project: &str) -> NimbusResult<()> {
        let foreign_org = org != ctx.org && !ctx.is_cloud_admin();
        let foreign_project = project != ctx.project && !(ctx.is_cloud_admin() || ctx.is_org_admin());
        if foreign_org || foreign_project {
            return Err(NimbusError::unauthorized(format!("scope of {org}/{project}")));
        }
        Ok(())
    }
}

//! Snapshot catalog and recycle bin tests

#![cfg(feature = "test-helpers")]

use nimbus_core::error::NimbusResult;
use nimbus_core::test_helpers::{vm_request, TestCloud};
use pretty_assertions::assert_eq;

const RESOURCE: &str = "acme_default_web1";

#[tokio::test]
async fn test_snapshot_lifecycle() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let store = &cloud.store;
    let ctx = &cloud.admin;

    let snapshot = store.add_snapshot(ctx, RESOURCE, "Before Upgrade", "qcow2").await?;
    assert_eq!(snapshot.name, "before_upgrade");
    let err = store
        .add_snapshot(ctx, RESOURCE, "before upgrade", "qcow2")
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    store.add_snapshot(ctx, RESOURCE, "nightly", "").await?;
    let found = store.get_snapshot(ctx, RESOURCE, "nightly").await?.unwrap();
    assert_eq!(found.resource_id, RESOURCE);

    let mut names: Vec<String> = store
        .snapshots_for_resource(ctx, RESOURCE)
        .await?
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["before_upgrade", "nightly"]);

    assert!(store.delete_snapshot(ctx, RESOURCE, "nightly").await?);
    assert!(!store.delete_snapshot(ctx, RESOURCE, "nightly").await?);
    assert!(store.get_snapshot(ctx, RESOURCE, "nightly").await?.is_none());

    assert_eq!(store.delete_all_snapshots(ctx, RESOURCE).await?, 1);
    assert!(store.snapshots_for_resource(ctx, RESOURCE).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_snapshots_stay_in_their_project() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let staging = cloud.admin.with_project("acme", "staging")?;
    cloud.store.add_snapshot(&staging, RESOURCE, "nightly", "").await?;

    assert!(cloud
        .store
        .snapshots_for_resource(&cloud.admin, RESOURCE)
        .await?
        .is_empty());
    assert_eq!(
        cloud.store.snapshots_for_resource(&staging, RESOURCE).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_deleted_vms_pile_up_in_recycle_bin() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("h1", "amd64", 8, 16384).await?;
    cloud.add_image("ubuntu", "amd64").await?;
    let ctx = &cloud.admin;

    for _ in 0..2 {
        cloud
            .orchestrator
            .create_vm(ctx, &vm_request("web1", "ubuntu", 1, 1024))
            .await?;
        cloud.orchestrator.delete_vm(ctx, "web1").await?;
    }

    let entries = cloud.store.recycled_objects(ctx, "web1", None).await?;
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].stamp, entries[1].stamp);
    assert!(entries[0].object_json.contains("web1"));

    let one = cloud
        .store
        .recycled_objects(ctx, "web1", Some(&entries[1].stamp))
        .await?;
    assert_eq!(one, vec![entries[1].clone()]);

    // Other projects see nothing
    let staging = ctx.with_project("acme", "staging")?;
    assert!(cloud.store.recycled_objects(&staging, "web1", None).await?.is_empty());

    assert!(cloud.store.purge_recycled_objects(ctx, "web1").await?);
    assert!(cloud.store.recycled_objects(ctx, "web1", None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_snapshots_follow_renamed_vm() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("h1", "amd64", 8, 16384).await?;
    cloud.add_image("ubuntu", "amd64").await?;
    let ctx = &cloud.admin;
    let vm = cloud
        .orchestrator
        .create_vm(ctx, &vm_request("web1", "ubuntu", 1, 1024))
        .await?;
    let old_key = vm.id.storage_key();
    cloud.store.add_snapshot(ctx, &old_key, "nightly", "").await?;

    cloud.orchestrator.rename_vm(ctx, "web1", "web2", None).await?;
    let new_key = ctx.scoped("web2")?.storage_key();

    let moved = cloud.store.get_snapshot(ctx, &new_key, "nightly").await?.unwrap();
    assert_eq!(moved.resource_id, new_key);
    assert!(cloud.store.get_snapshot(ctx, &old_key, "nightly").await?.is_none());
    assert_eq!(cloud.store.snapshots_for_resource(ctx, &new_key).await?, vec![moved]);
    assert!(cloud.store.snapshots_for_resource(ctx, &old_key).await?.is_empty());

    assert!(cloud.store.delete_snapshot(ctx, &new_key, "nightly").await?);
    Ok(())
}

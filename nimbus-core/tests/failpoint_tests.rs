//! Store fault injection tests
//!
//! Each test makes the store step of a workflow fail after the host side
//! succeeded and checks that the host side is undone.

#![cfg(all(feature = "test-helpers", feature = "failpoints"))]

use nimbus_core::error::NimbusResult;
use nimbus_core::failpoints::{self, scenarios, STORE_PUT, STORE_RELATIONSHIP, STORE_TRANSACTION};
use nimbus_core::remote::Script;
use nimbus_core::test_helpers::{vm_request, TestCloud};
use pretty_assertions::assert_eq;
use serial_test::serial;

async fn cloud_with_host() -> NimbusResult<TestCloud> {
    failpoints::init();
    let cloud = TestCloud::new().await?;
    cloud.add_host("h1", "amd64", 8, 16384).await?;
    cloud.add_image("ubuntu", "amd64").await?;
    Ok(cloud)
}

#[tokio::test]
#[serial]
async fn test_create_vm_record_failure_deletes_vm_on_host() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;

    scenarios::fail_always(STORE_PUT);
    let result = cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("web1", "ubuntu", 1, 1024))
        .await;
    scenarios::disable(STORE_PUT);
    assert!(result.is_err());

    let id = cloud.admin.scoped("web1")?;
    let deletes = cloud.executor.calls_to(Script::DeleteVm);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].args, vec![id.host_label()]);
    assert!(cloud.store.get_vm(&cloud.admin, &id).await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_rename_record_failure_renames_back() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;
    cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("web1", "ubuntu", 1, 1024))
        .await?;

    let result = failpoints::with_failpoint(
        STORE_TRANSACTION,
        "return",
        cloud.orchestrator.rename_vm(&cloud.admin, "web1", "web2", None),
    )
    .await;
    assert!(result.is_err());

    let old_label = cloud.admin.scoped("web1")?.host_label();
    let new_label = cloud.admin.scoped("web2")?.host_label();
    let renames = cloud.executor.calls_to(Script::RenameVm);
    assert_eq!(renames.len(), 2);
    assert_eq!(renames[0].args[..2], [old_label.clone(), new_label.clone()]);
    assert_eq!(renames[1].args[..2], [new_label, old_label]);

    assert!(cloud
        .store
        .get_vm(&cloud.admin, &cloud.admin.scoped("web1")?)
        .await?
        .is_some());
    assert!(cloud
        .store
        .get_vm(&cloud.admin, &cloud.admin.scoped("web2")?)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_membership_failure_removes_bridge() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;
    let host = cloud.store.get_host(&cloud.admin, "h1").await?.unwrap();
    let id = cloud.admin.scoped("mesh")?;

    let result = failpoints::with_failpoint(
        STORE_RELATIONSHIP,
        "return",
        cloud.orchestrator.vnets().expand(&cloud.admin, &id, &host, true),
    )
    .await;
    assert!(result.is_err());
    cloud.orchestrator.settle().await;

    assert!(cloud.store.vnet_hosts(&cloud.admin, &id).await?.is_empty());
    assert_eq!(cloud.executor.count(Script::AddOrModifyVxlanBridge), 1);
    assert_eq!(cloud.executor.count(Script::DeleteVxlanBridge), 1);
    assert!(cloud.executor.bridge_members(&id.host_label()).is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_attachment_record_failure_detaches_vm() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;
    cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("web1", "ubuntu", 1, 1024))
        .await?;
    let mesh = cloud.admin.scoped("mesh")?;

    // The host joins the mesh, the VM edge is not written
    scenarios::fail_after_n(STORE_RELATIONSHIP, 1);
    let result = cloud
        .orchestrator
        .add_vm_vnet(&cloud.admin, "web1", "mesh", true)
        .await;
    scenarios::disable(STORE_RELATIONSHIP);
    assert!(result.is_err());
    cloud.orchestrator.settle().await;

    assert!(cloud.store.vms_for_vnet(&cloud.admin, &mesh).await?.is_empty());
    assert_eq!(cloud.executor.count(Script::AttachVmToVxlanBridge), 1);
    assert_eq!(cloud.executor.count(Script::DetachVmFromVxlanBridge), 1);
    // The host only joined for this VM, so it leaves again
    assert!(cloud.store.vnet_hosts(&cloud.admin, &mesh).await?.is_empty());
    assert_eq!(cloud.executor.count(Script::DeleteVxlanBridge), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_add_project_membership_failure_drops_project() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;

    // The project row goes in, the creator's membership does not
    scenarios::fail_after_n(STORE_PUT, 1);
    let result = cloud
        .orchestrator
        .add_project(&cloud.admin, "staging", "pre-prod")
        .await;
    scenarios::disable(STORE_PUT);
    assert!(result.is_err());

    assert!(cloud
        .store
        .get_project(&cloud.admin, "acme", "staging")
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_store_recovers_after_failpoint() -> NimbusResult<()> {
    let cloud = cloud_with_host().await?;

    scenarios::fail_always(STORE_PUT);
    assert!(cloud
        .orchestrator
        .create_vnet(&cloud.admin, "netA", "")
        .await
        .is_err());
    scenarios::disable_all();

    let vnet = cloud.orchestrator.create_vnet(&cloud.admin, "netA", "").await?;
    assert_eq!(vnet.id, cloud.admin.scoped("netA")?);
    Ok(())
}

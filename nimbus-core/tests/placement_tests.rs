//! Host placement tests

#![cfg(feature = "test-helpers")]

use std::time::Duration;

use nimbus_core::error::{NimbusError, NimbusResult};
use nimbus_core::host_chooser::PlacementRequest;
use nimbus_core::remote::Script;
use nimbus_core::test_helpers::{host, vm_request, TestCloud};
use pretty_assertions::assert_eq;

fn placement(vcpus: u32, memory_mb: u64, architecture: &str) -> PlacementRequest {
    PlacementRequest {
        vcpus,
        memory_mb,
        disk_gb: 10,
        architecture: architecture.to_string(),
    }
}

#[tokio::test]
async fn test_never_crosses_architecture() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("x86", "amd64", 2, 4096).await?;
    cloud.add_host("arm", "aarch64", 64, 262144).await?;
    let chooser = cloud.orchestrator.chooser();

    let chosen = chooser.host_for(&cloud.admin, &placement(1, 512, "amd64")).await?;
    assert_eq!(chosen.unwrap().hostname, "x86");
    let chosen = chooser.host_for(&cloud.admin, &placement(1, 512, "AARCH64")).await?;
    assert_eq!(chosen.unwrap().hostname, "arm");
    assert!(chooser
        .host_for(&cloud.admin, &placement(1, 512, "riscv64"))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_empty_architecture_is_invalid() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let err = cloud
        .orchestrator
        .chooser()
        .host_for(&cloud.admin, &placement(1, 512, " "))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn test_reserved_hosts_bind_their_org() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("shared", "amd64", 64, 262144).await?;
    let mut reserved = host("acme-only", "amd64", 2, 4096);
    reserved.org = Some("acme".to_string());
    cloud.orchestrator.add_host(&cloud.admin, &reserved).await?;
    let chooser = cloud.orchestrator.chooser();

    // acme holds a reserved host, so the roomier shared pool is off limits
    let chosen = chooser.host_for(&cloud.admin, &placement(1, 512, "amd64")).await?;
    assert_eq!(chosen.unwrap().hostname, "acme-only");
    assert!(chooser
        .host_for(&cloud.admin, &placement(16, 512, "amd64"))
        .await?
        .is_none());

    // Everyone else shares the unreserved pool
    let other = cloud.admin.with_project("globex", "default")?;
    let chosen = chooser.host_for(&other, &placement(1, 512, "amd64")).await?;
    assert_eq!(chosen.unwrap().hostname, "shared");
    Ok(())
}

#[tokio::test]
async fn test_reservation_ignores_org_case() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("shared", "amd64", 64, 262144).await?;
    let mut reserved = host("acme-only", "amd64", 2, 4096);
    reserved.org = Some(" ACME ".to_string());
    cloud.orchestrator.add_host(&cloud.admin, &reserved).await?;

    let stored = cloud.store.get_host(&cloud.admin, "acme-only").await?.unwrap();
    assert_eq!(stored.org.as_deref(), Some("acme"));

    let chosen = cloud
        .orchestrator
        .chooser()
        .host_for(&cloud.admin, &placement(1, 512, "amd64"))
        .await?;
    assert_eq!(chosen.unwrap().hostname, "acme-only");
    Ok(())
}

#[tokio::test]
async fn test_blank_reservation_is_unreserved() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let mut open = host("open", "amd64", 2, 4096);
    open.org = Some("  ".to_string());
    cloud.orchestrator.add_host(&cloud.admin, &open).await?;

    let stored = cloud.store.get_host(&cloud.admin, "open").await?.unwrap();
    assert_eq!(stored.org, None);
    let other = cloud.admin.with_project("globex", "default")?;
    let chosen = cloud
        .orchestrator
        .chooser()
        .host_for(&other, &placement(1, 512, "amd64"))
        .await?;
    assert_eq!(chosen.unwrap().hostname, "open");
    Ok(())
}

#[tokio::test]
async fn test_huge_memory_request_is_invalid() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("h1", "amd64", 2, 4096).await?;
    let err = cloud
        .orchestrator
        .chooser()
        .host_for(&cloud.admin, &placement(1, u64::MAX / 2, "amd64"))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn test_existing_vms_consume_capacity() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_image("ubuntu", "amd64").await?;
    // 2 cores × 4 = 8 vCPUs, 8 GiB at factor 1.0
    cloud.add_host("h1", "amd64", 2, 8192).await?;
    cloud.add_host("h2", "amd64", 1, 8192).await?;

    let first = cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("a", "ubuntu", 6, 1024))
        .await?;
    assert_eq!(first.hostname, "h1");
    // h1 has 2 vCPUs left, h2 has 4
    let second = cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("b", "ubuntu", 1, 1024))
        .await?;
    assert_eq!(second.hostname, "h2");

    let err = cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("c", "ubuntu", 1, 8192))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::SchedulingError { .. }));
    Ok(())
}

#[tokio::test]
async fn test_ties_break_on_memory_then_name() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("b-host", "amd64", 4, 8192).await?;
    cloud.add_host("a-host", "amd64", 4, 8192).await?;
    cloud.add_host("big-ram", "amd64", 4, 16384).await?;
    let chooser = cloud.orchestrator.chooser();

    let chosen = chooser.host_for(&cloud.admin, &placement(1, 512, "amd64")).await?;
    assert_eq!(chosen.unwrap().hostname, "big-ram");

    cloud.orchestrator.delete_host(&cloud.admin, "big-ram").await?;
    let chosen = chooser.host_for(&cloud.admin, &placement(1, 512, "amd64")).await?;
    assert_eq!(chosen.unwrap().hostname, "a-host");
    Ok(())
}

/// Placement reads free capacity without holding it. Two creates that
/// overlap both see the same empty host, even though it only has room for
/// one of them.
#[tokio::test]
async fn test_concurrent_creates_oversubscribe() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud.add_image("ubuntu", "amd64").await?;
    // Room for exactly one 4 vCPU / 4096 MB VM
    cloud.add_host("h1", "amd64", 1, 4096).await?;
    // Rows are written after the host script returns
    cloud.executor.slow(Script::CreateVm, Duration::from_millis(200));

    let first_request = vm_request("first", "ubuntu", 4, 4096);
    let second_request = vm_request("second", "ubuntu", 4, 4096);
    let (first, second) = tokio::join!(
        cloud.orchestrator.create_vm(&cloud.admin, &first_request),
        cloud.orchestrator.create_vm(&cloud.admin, &second_request),
    );
    let (first, second) = (first?, second?);
    assert_eq!(first.hostname, "h1");
    assert_eq!(second.hostname, "h1");

    let on_host = cloud.store.vms_on_host(&cloud.admin, "h1").await?;
    let allocated: u32 = on_host.iter().map(|vm| vm.cpus).sum();
    assert_eq!(allocated, 8);

    // Once the rows exist the host reads as full
    let err = cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("third", "ubuntu", 1, 512))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::SchedulingError { .. }));
    Ok(())
}

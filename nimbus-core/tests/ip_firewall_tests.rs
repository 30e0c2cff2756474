//! Public IP, private IP and firewall workflow tests

#![cfg(feature = "test-helpers")]

use std::collections::BTreeSet;
use std::net::IpAddr;

use nimbus_core::error::{NimbusError, NimbusResult};
use nimbus_core::remote::Script;
use nimbus_core::test_helpers::{vm_request, TestCloud};
use nimbus_core::workflows::PublicIpRequest;
use nimbus_core::NimbusConfig;
use pretty_assertions::assert_eq;

fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

fn public_ip_for(vm: &str) -> PublicIpRequest {
    PublicIpRequest {
        vm: vm.to_string(),
        ..Default::default()
    }
}

/// `h1` runs VMs, `edge` terminates the public range
async fn cloud_with_edge() -> NimbusResult<TestCloud> {
    let cloud = TestCloud::new().await?;
    cloud.add_host("h1", "amd64", 8, 16384).await?;
    cloud.add_host("edge", "amd64", 1, 1024).await?;
    cloud.add_image("ubuntu", "amd64").await?;
    cloud.orchestrator.add_host_ip(&cloud.admin, "edge", "203.0.113.10").await?;
    let mut request = vm_request("web1", "ubuntu", 1, 512);
    request.hostname = Some("h1".to_string());
    cloud.orchestrator.create_vm(&cloud.admin, &request).await?;
    Ok(cloud)
}

#[tokio::test]
async fn test_assign_public_ip_routes_through_vtep() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    cloud.executor.clear_calls();

    let assigned = cloud.orchestrator.assign_public_ip(ctx, &public_ip_for("web1")).await?;
    assert_eq!(assigned.ip, ip("203.0.113.10"));
    assert!(assigned.warning.is_none());

    let backbone = ctx.backbone_vnet()?;
    assert_eq!(backbone.to_string(), "acme_default_acme-default-internet-backbone");
    let label = backbone.host_label();
    assert_eq!(
        cloud.executor.bridge_members(&label),
        BTreeSet::from(["edge.lan".to_string(), "h1.lan".to_string()])
    );

    let scripts: Vec<Script> = cloud.executor.calls().iter().map(|c| c.script).collect();
    assert_eq!(scripts.first(), Some(&Script::GuestCheck));
    assert_eq!(scripts.last(), Some(&Script::AssignVmIpViaVxlan));

    let route = &cloud.executor.calls_to(Script::AssignIpToVxlanBridge)[0];
    assert_eq!(route.hostname, "edge");
    assert_eq!(route.args[2], "203.0.113.10");

    let configure = &cloud.executor.calls_to(Script::AssignVmIpViaVxlan)[0];
    assert_eq!(configure.hostname, "h1");
    assert_eq!(
        configure.args[3..],
        ["203.0.113.10", "8.8.8.8", "4.4.4.4", "1200"]
    );

    let vm_id = ctx.scoped("web1")?;
    let entry = cloud.store.get_ip(ctx, assigned.ip).await?.unwrap();
    assert_eq!(entry.allocated_to, Some(vm_id.clone()));
    assert_eq!(cloud.orchestrator.vm_public_ips(ctx, "web1").await?, vec![assigned.ip]);
    assert_eq!(cloud.orchestrator.list_assigned_ips(ctx).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_second_public_ip_is_refused() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    cloud.orchestrator.add_host_ip(&cloud.admin, "edge", "203.0.113.11").await?;
    cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web1"))
        .await?;

    let err = cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidOperation { .. }));
    Ok(())
}

#[tokio::test]
async fn test_empty_pool_is_exhausted() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    cloud
        .orchestrator
        .create_vm(&cloud.admin, &vm_request("web2", "ubuntu", 1, 512))
        .await?;
    cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web1"))
        .await?;

    let err = cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web2"))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::ResourceExhausted { .. }));
    Ok(())
}

#[tokio::test]
async fn test_dead_guest_blocks_assignment() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    cloud.executor.fail_always(Script::GuestCheck);

    assert!(cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web1"))
        .await
        .is_err());
    assert!(cloud.store.get_ip(&cloud.admin, ip("203.0.113.10")).await?.unwrap().is_free());
    assert_eq!(cloud.executor.count(Script::AddOrModifyVxlanBridge), 0);
    Ok(())
}

#[tokio::test]
async fn test_guest_configuration_failure_is_a_warning() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    cloud.executor.fail_always(Script::AssignVmIpViaVxlan);

    let assigned = cloud
        .orchestrator
        .assign_public_ip(&cloud.admin, &public_ip_for("web1"))
        .await?;
    assert!(assigned.warning.unwrap().contains("configure it manually"));
    // The address counts as assigned all the same
    assert_eq!(
        cloud.orchestrator.vm_public_ips(&cloud.admin, "web1").await?,
        vec![assigned.ip]
    );
    assert!(!cloud.store.get_ip(&cloud.admin, assigned.ip).await?.unwrap().is_free());
    Ok(())
}

#[tokio::test]
async fn test_unassign_last_ip_retracts_backbone() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    let assigned = cloud.orchestrator.assign_public_ip(ctx, &public_ip_for("web1")).await?;

    let released = cloud
        .orchestrator
        .unassign_public_ip(ctx, "web1", assigned.ip, None)
        .await?;
    assert!(released.warning.is_none());

    let backbone = ctx.backbone_vnet()?;
    let vm_id = ctx.scoped("web1")?;
    assert!(cloud.store.get_ip(ctx, assigned.ip).await?.unwrap().is_free());
    assert!(cloud.store.vnets_for_vm(ctx, &vm_id).await?.is_empty());
    assert!(cloud.store.vnet_hosts(ctx, &backbone).await?.is_empty());
    assert!(cloud.executor.bridge_members(&backbone.host_label()).is_empty());
    assert_eq!(cloud.executor.count(Script::DetachVmFromVxlanBridge), 1);
    assert_eq!(cloud.executor.count(Script::UnassignIpToVxlanBridge), 1);

    let err = cloud.orchestrator.vm_public_ips(ctx, "web1").await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_unassign_keeps_backbone_where_still_needed() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let ctx = &cloud.admin;
    cloud.add_host("h1", "amd64", 8, 16384).await?;
    cloud.add_image("ubuntu", "amd64").await?;
    // Both addresses terminate on whichever host runs the VM
    assert_eq!(cloud.orchestrator.add_host_ip(ctx, "*", "203.0.113.0/30").await?, 2);
    cloud.orchestrator.create_vm(ctx, &vm_request("web1", "ubuntu", 1, 512)).await?;
    cloud.orchestrator.create_vm(ctx, &vm_request("web2", "ubuntu", 1, 512)).await?;
    let first = cloud.orchestrator.assign_public_ip(ctx, &public_ip_for("web1")).await?;
    cloud.orchestrator.assign_public_ip(ctx, &public_ip_for("web2")).await?;

    cloud.orchestrator.unassign_public_ip(ctx, "web1", first.ip, None).await?;

    let backbone = ctx.backbone_vnet()?;
    assert_eq!(cloud.store.vnet_hosts(ctx, &backbone).await?, vec!["h1".to_string()]);
    assert_eq!(cloud.executor.count(Script::DeleteVxlanBridge), 0);
    Ok(())
}

#[tokio::test]
async fn test_unassign_foreign_ip_is_rejected() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let err = cloud
        .orchestrator
        .unassign_public_ip(&cloud.admin, "web1", ip("198.51.100.1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidOperation { .. }));
    assert_eq!(cloud.executor.count(Script::UnassignIpToVxlanBridge), 0);
    Ok(())
}

#[tokio::test]
async fn test_oversized_ranges_are_refused() -> NimbusResult<()> {
    let mut config = NimbusConfig::test();
    config.provisioning.max_ip_range_hosts = 16;
    let cloud = TestCloud::with_config(config).await?;
    let ctx = &cloud.admin;

    for range in ["10.0.0.0/8", "2001:db8::/64", "::/0", "203.0.113.0/27"] {
        let err = cloud.orchestrator.add_host_ip(ctx, "*", range).await.unwrap_err();
        assert!(matches!(err, NimbusError::Validation { .. }), "{range}");
    }
    assert!(cloud.store.list_ips(ctx).await?.is_empty());

    // A /28 fits and adding it again finds nothing new
    assert_eq!(cloud.orchestrator.add_host_ip(ctx, "*", "203.0.113.0/28").await?, 14);
    assert_eq!(cloud.orchestrator.add_host_ip(ctx, "*", "203.0.113.0/28").await?, 0);
    assert_eq!(cloud.store.list_ips(ctx).await?.len(), 14);
    Ok(())
}

#[tokio::test]
async fn test_add_host_ip_needs_known_host() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let err = cloud
        .orchestrator
        .add_host_ip(&cloud.admin, "ghost", "203.0.113.1")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = cloud
        .orchestrator
        .add_host_ip(&cloud.admin, "*", "203.0.113.0/99")
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn test_vnet_ip_lifecycle() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    cloud.orchestrator.add_vm_vnet(ctx, "web1", "netA", true).await?;
    let vm_id = ctx.scoped("web1")?;
    let net_a = ctx.scoped("netA")?;

    let assigned = cloud
        .orchestrator
        .assign_vnet_ip(ctx, "web1", ip("10.0.0.5"), "netA", Some(9000))
        .await?;
    assert!(assigned.warning.is_none());
    assert_eq!(cloud.store.vm_vnet_ips(ctx, &vm_id).await?, vec![(net_a.clone(), ip("10.0.0.5"))]);
    let call = &cloud.executor.calls_to(Script::AssignVmIpViaVnet)[0];
    assert_eq!(call.args[3..], ["10.0.0.5", "9000"]);

    let err = cloud
        .orchestrator
        .assign_vnet_ip(ctx, "web1", ip("10.0.0.6"), "netA", None)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    cloud
        .orchestrator
        .unassign_vnet_ip(ctx, "web1", ip("10.0.0.5"), "netA")
        .await?;
    assert!(cloud.store.vm_vnet_ips(ctx, &vm_id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_vnet_ip_guest_failure_records_nothing() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    cloud.orchestrator.create_vnet(ctx, "netA", "backend").await?;
    cloud.executor.fail_always(Script::AssignVmIpViaVnet);

    let assigned = cloud
        .orchestrator
        .assign_vnet_ip(ctx, "web1", ip("10.0.0.5"), "netA", None)
        .await?;
    assert!(assigned.warning.is_some());
    assert!(cloud.store.vm_vnet_ips(ctx, &ctx.scoped("web1")?).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_ruleset_create_and_delete() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    let orchestrator = &cloud.orchestrator;

    orchestrator
        .create_firewall_ruleset(ctx, "web", "v1", r#"[{"port":80}]"#, false)
        .await?;
    let err = orchestrator
        .create_firewall_ruleset(ctx, "web", "v2", r#"[{"port":8080}]"#, false)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());
    orchestrator
        .create_firewall_ruleset(ctx, "web", "v2", r#"[{"port":8080}]"#, true)
        .await?;
    assert_eq!(orchestrator.get_firewall_ruleset(ctx, "web").await?.description, "v2");
    assert!(orchestrator
        .create_firewall_ruleset(ctx, "bad", "", r#"{"port":80}"#, false)
        .await
        .is_err());
    assert_eq!(orchestrator.list_firewall_rulesets(ctx).await?.len(), 1);

    // Missing rulesets delete quietly
    assert!(!orchestrator.delete_firewall_ruleset(ctx, "nope").await?);

    orchestrator.add_vm_vnet(ctx, "web1", "netA", true).await?;
    orchestrator.apply_firewall_ruleset(ctx, "web1", "web", Some("netA")).await?;
    let err = orchestrator.delete_firewall_ruleset(ctx, "web").await.unwrap_err();
    assert!(matches!(err, NimbusError::InUse { .. }));

    orchestrator.remove_firewall_ruleset(ctx, "web1", "web", Some("netA")).await?;
    assert!(orchestrator.delete_firewall_ruleset(ctx, "web").await?);
    assert!(orchestrator.get_firewall_ruleset(ctx, "web").await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_private_ruleset_runs_on_vm_host() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    let orchestrator = &cloud.orchestrator;
    let net = orchestrator.add_vm_vnet(ctx, "web1", "netA", true).await?;
    orchestrator
        .create_firewall_ruleset(ctx, "web", "", r#"[{"port":80},{"port":443}]"#, false)
        .await?;

    orchestrator.apply_firewall_ruleset(ctx, "web1", "web", Some("netA")).await?;
    let call = &cloud.executor.calls_to(Script::ApplyFirewallRulesetPrivate)[0];
    assert_eq!(call.hostname, "h1");
    assert_eq!(
        call.args,
        vec![
            r#"[{"port":443},{"port":80}]"#.to_string(),
            net.vnet().vnet_num.to_string(),
            "web1_acme_default".to_string(),
            "web_acme_default".to_string(),
        ]
    );

    let err = orchestrator
        .apply_firewall_ruleset(ctx, "web1", "web", Some("netA"))
        .await
        .unwrap_err();
    assert!(err.is_already_exists());
    let err = orchestrator
        .remove_firewall_ruleset(ctx, "web1", "web", None)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidOperation { .. }));
    Ok(())
}

#[tokio::test]
async fn test_public_ruleset_runs_on_vtep() -> NimbusResult<()> {
    let cloud = cloud_with_edge().await?;
    let ctx = &cloud.admin;
    let orchestrator = &cloud.orchestrator;
    orchestrator
        .create_firewall_ruleset(ctx, "web", "", r#"[{"port":80}]"#, false)
        .await?;

    // No public IP yet
    let err = orchestrator
        .apply_firewall_ruleset(ctx, "web1", "web", Some(""))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::NotFound { .. } | NimbusError::InvalidOperation { .. }));

    orchestrator.assign_public_ip(ctx, &public_ip_for("web1")).await?;
    orchestrator.apply_firewall_ruleset(ctx, "web1", "web", None).await?;
    let call = &cloud.executor.calls_to(Script::ApplyFirewallRulesetPublic)[0];
    assert_eq!(call.hostname, "edge");
    assert_eq!(call.args[1], "203.0.113.10");

    let applied = cloud.store.vm_firewalls(ctx, &ctx.scoped("web1")?).await?;
    assert_eq!(applied, vec![(ctx.backbone_vnet()?, ctx.scoped("web")?)]);
    Ok(())
}

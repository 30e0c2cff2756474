//! Org, project and user workflow tests

#![cfg(feature = "test-helpers")]

use nimbus_core::context::RequestContext;
use nimbus_core::error::NimbusResult;
use nimbus_core::test_helpers::{TestCloud, ADMIN_ID};
use nimbus_core::types::Role;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_bootstrap_only_on_empty_cloud() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let admin = cloud.store.get_user(&cloud.admin, ADMIN_ID).await?.unwrap();
    assert_eq!(admin.role, Role::CloudAdmin);

    // A second setup request finds users and gets no free pass
    let mut intruder = RequestContext::new("mallory@evil.io", Role::User, "evil", "default")?;
    intruder.setup = true;
    let err = cloud
        .store
        .add_user(&intruder, "mallory@evil.io", "Mallory", None, "cloudadmin")
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    Ok(())
}

#[tokio::test]
async fn test_init_org_creates_default_project() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let project = cloud
        .store
        .get_project(&cloud.admin, "acme", "default")
        .await?
        .unwrap();
    assert_eq!(project.description, "Default project for org acme");

    let projects = cloud.orchestrator.get_user_projects(&cloud.admin).await?;
    assert_eq!(projects.len(), 1);
    // Running it again is harmless
    assert!(!cloud.orchestrator.init_org(&cloud.admin).await?);
    Ok(())
}

#[tokio::test]
async fn test_project_membership_round_trip() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let admin = &cloud.admin;
    let orchestrator = &cloud.orchestrator;

    assert!(orchestrator.add_project(admin, "staging", "pre-prod").await?);
    assert!(!orchestrator.add_project(admin, "Staging", "again").await?);

    orchestrator.add_user(admin, "Dev@Acme.io", "Dev", None, None).await?;
    assert!(orchestrator.add_user_to_project(admin, "dev@acme.io", Some("staging")).await?);
    assert!(!orchestrator.add_user_to_project(admin, "dev@acme.io", Some("staging")).await?);

    let dev = RequestContext::new("dev@acme.io", Role::User, "acme", "staging")?;
    let projects = orchestrator.get_user_projects(&dev).await?;
    assert_eq!(
        projects.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        vec!["staging"]
    );

    assert!(orchestrator
        .delete_user_from_project(admin, "dev@acme.io", Some("staging"), None)
        .await?);
    assert!(orchestrator.get_user_projects(&dev).await?.is_empty());

    assert!(orchestrator.delete_project(admin, Some("staging"), None).await?);
    assert!(cloud.store.get_project(admin, "acme", "staging").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_add_user_to_missing_project_fails() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud
        .orchestrator
        .add_user(&cloud.admin, "dev@acme.io", "Dev", None, None)
        .await?;
    let err = cloud
        .orchestrator
        .add_user_to_project(&cloud.admin, "dev@acme.io", Some("nowhere"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_roles_are_clamped_to_the_granter() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let orchestrator = &cloud.orchestrator;
    let boss = orchestrator
        .add_user(&cloud.admin, "boss@acme.io", "Boss", None, Some("orgadmin"))
        .await?;
    assert_eq!(boss.role, Role::OrgAdmin);

    let boss_ctx = RequestContext::new("boss@acme.io", Role::OrgAdmin, "acme", "default")?;
    let promoted = orchestrator
        .add_user(&boss_ctx, "dev@acme.io", "Dev", Some("other"), Some("cloudadmin"))
        .await?;
    assert_eq!(promoted.role, Role::User);
    // Org admins cannot reach into another org
    assert_eq!(promoted.org, "acme");

    let changed = orchestrator
        .change_user_role(&boss_ctx, "dev@acme.io", "orgadmin")
        .await?;
    assert_eq!(changed.role, Role::OrgAdmin);
    let err = orchestrator
        .change_user_role(&boss_ctx, ADMIN_ID, "user")
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    Ok(())
}

#[tokio::test]
async fn test_user_cannot_delete_admin() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    let dev = cloud.add_member("dev@acme.io", "default").await?;

    let err = cloud
        .orchestrator
        .delete_user(&dev, ADMIN_ID, None)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let err = cloud
        .orchestrator
        .delete_user(&cloud.admin, "ghost@acme.io", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    cloud.orchestrator.delete_user(&cloud.admin, "dev@acme.io", None).await?;
    assert!(cloud.store.get_user(&cloud.admin, "dev@acme.io").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_non_member_is_locked_out() -> NimbusResult<()> {
    let cloud = TestCloud::new().await?;
    cloud
        .orchestrator
        .add_user(&cloud.admin, "dev@acme.io", "Dev", None, None)
        .await?;
    let dev = RequestContext::new("dev@acme.io", Role::User, "acme", "default")?;

    let err = cloud
        .orchestrator
        .create_vnet(&dev, "netA", "")
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    let err = cloud.orchestrator.add_project(&dev, "mine", "").await.unwrap_err();
    assert!(err.is_unauthorized());
    Ok(())
}

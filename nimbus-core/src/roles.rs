//! Role enforcement
//!
//! Access is decided by a fixed table of (role, action category) grants.
//! Only one grant needs the store: a plain user may edit project resources
//! or add users when they belong to the active project.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::types::{normalize_name, Role};

/// Action taxonomy every store and workflow call is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionCategory {
    EditCloudResource,
    LookupCloudResource,
    LookupCloudResourceForProject,
    EditProjectResource,
    LookupProjectResource,
    EditOrg,
    LookupOrg,
    AddUserToOrg,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 8] = [
        ActionCategory::EditCloudResource,
        ActionCategory::LookupCloudResource,
        ActionCategory::LookupCloudResourceForProject,
        ActionCategory::EditProjectResource,
        ActionCategory::LookupProjectResource,
        ActionCategory::EditOrg,
        ActionCategory::LookupOrg,
        ActionCategory::AddUserToOrg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCategory::EditCloudResource => "edit_cloud_resource",
            ActionCategory::LookupCloudResource => "lookup_cloud_resource",
            ActionCategory::LookupCloudResourceForProject => "lookup_cloud_resource_for_project",
            ActionCategory::EditProjectResource => "edit_project_resource",
            ActionCategory::LookupProjectResource => "lookup_project_resource",
            ActionCategory::EditOrg => "edit_org",
            ActionCategory::LookupOrg => "lookup_org",
            ActionCategory::AddUserToOrg => "add_user_to_org",
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Allow,
    Deny,
    /// Allowed only for members of the caller's active project
    RequiresProjectMembership,
}

/// Store queries the enforcer depends on
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn is_project_member(&self, user_id: &str, org: &str, project: &str)
        -> NimbusResult<bool>;

    /// Number of users in the whole cloud
    async fn user_count(&self) -> NimbusResult<u64>;
}

/// Role enforcement engine
#[derive(Debug, Clone)]
pub struct RoleEnforcer {
    grants: HashMap<(Role, ActionCategory), Grant>,
}

impl RoleEnforcer {
    /// Create an enforcer with the built-in grant table
    pub fn new() -> Self {
        let mut enforcer = Self {
            grants: HashMap::new(),
        };
        enforcer.init_default_grants();
        enforcer
    }

    fn init_default_grants(&mut self) {
        use ActionCategory::*;

        // Cloud admin passes everything
        for action in ActionCategory::ALL {
            self.grants.insert((Role::CloudAdmin, action), Grant::Allow);
        }

        // Org admin runs the org but never touches the cloud catalog
        for action in [
            EditProjectResource,
            LookupProjectResource,
            EditOrg,
            LookupOrg,
            AddUserToOrg,
            LookupCloudResourceForProject,
        ] {
            self.grants.insert((Role::OrgAdmin, action), Grant::Allow);
        }

        // User reads freely, edits only inside projects it belongs to
        self.grants
            .insert((Role::User, LookupCloudResourceForProject), Grant::Allow);
        self.grants
            .insert((Role::User, LookupProjectResource), Grant::Allow);
        self.grants.insert(
            (Role::User, EditProjectResource),
            Grant::RequiresProjectMembership,
        );
        self.grants
            .insert((Role::User, AddUserToOrg), Grant::RequiresProjectMembership);
    }

    pub fn grant(&self, action: ActionCategory, role: Role) -> Grant {
        self.grants
            .get(&(role, action))
            .copied()
            .unwrap_or(Grant::Deny)
    }

    /// Unconditional table check; membership-dependent grants answer `false`
    pub fn check_access(&self, action: ActionCategory, role: Role) -> bool {
        self.grant(action, role) == Grant::Allow
    }

    /// Full check for a caller, consulting the store when the grant needs it
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        action: ActionCategory,
        membership: &dyn MembershipLookup,
    ) -> NimbusResult<()> {
        let allowed = match self.grant(action, ctx.role) {
            Grant::Allow => true,
            Grant::Deny => false,
            Grant::RequiresProjectMembership => {
                membership
                    .is_project_member(&ctx.user_id, &ctx.org, &ctx.project)
                    .await?
            }
        };

        if allowed {
            Ok(())
        } else {
            warn!(
                user = %ctx.user_id,
                role = %ctx.role,
                action = %action,
                "Unauthorized access attempt"
            );
            Err(NimbusError::unauthorized(action))
        }
    }

    /// True only when the caller asked for setup and no user exists yet
    pub async fn is_setup_mode(
        &self,
        ctx: &RequestContext,
        membership: &dyn MembershipLookup,
    ) -> NimbusResult<bool> {
        Ok(ctx.setup && membership.user_count().await? == 0)
    }

    /// Org a call should act on; only cloud admins may name another org
    pub fn normalized_org(
        &self,
        ctx: &RequestContext,
        requested: Option<&str>,
    ) -> NimbusResult<String> {
        match requested.filter(|org| !org.trim().is_empty()) {
            Some(org) if ctx.is_cloud_admin() => normalize_name(org),
            _ => Ok(ctx.org.clone()),
        }
    }

    /// Project a call should act on; cloud and org admins may name another one
    pub fn normalized_project(
        &self,
        ctx: &RequestContext,
        requested: Option<&str>,
    ) -> NimbusResult<String> {
        match requested.filter(|project| !project.trim().is_empty()) {
            Some(project) if ctx.is_cloud_admin() || ctx.is_org_admin() => {
                normalize_name(project)
            }
            _ => Ok(ctx.project.clone()),
        }
    }

    /// Role a caller may hand out, never above its own
    pub fn normalized_role(&self, ctx: &RequestContext, requested: &str) -> Role {
        let role = Role::parse_lenient(requested);
        match ctx.role {
            Role::CloudAdmin => role,
            Role::OrgAdmin if role != Role::CloudAdmin => role,
            _ => Role::User,
        }
    }
}

impl Default for RoleEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    struct FixedMembership {
        member: bool,
        users: u64,
    }

    #[async_trait]
    impl MembershipLookup for FixedMembership {
        async fn is_project_member(&self, _: &str, _: &str, _: &str) -> NimbusResult<bool> {
            Ok(self.member)
        }

        async fn user_count(&self) -> NimbusResult<u64> {
            Ok(self.users)
        }
    }

    fn ctx(role: Role) -> RequestContext {
        RequestContext::new("alice@acme.io", role, "acme", "default").unwrap()
    }

    #[rstest]
    #[case(Role::CloudAdmin, ActionCategory::EditCloudResource, Grant::Allow)]
    #[case(Role::CloudAdmin, ActionCategory::AddUserToOrg, Grant::Allow)]
    #[case(Role::OrgAdmin, ActionCategory::EditCloudResource, Grant::Deny)]
    #[case(Role::OrgAdmin, ActionCategory::LookupCloudResource, Grant::Deny)]
    #[case(Role::OrgAdmin, ActionCategory::LookupCloudResourceForProject, Grant::Allow)]
    #[case(Role::OrgAdmin, ActionCategory::EditOrg, Grant::Allow)]
    #[case(Role::User, ActionCategory::LookupProjectResource, Grant::Allow)]
    #[case(Role::User, ActionCategory::EditProjectResource, Grant::RequiresProjectMembership)]
    #[case(Role::User, ActionCategory::AddUserToOrg, Grant::RequiresProjectMembership)]
    #[case(Role::User, ActionCategory::EditOrg, Grant::Deny)]
    #[case(Role::User, ActionCategory::LookupOrg, Grant::Deny)]
    fn test_grant_table(#[case] role: Role, #[case] action: ActionCategory, #[case] expected: Grant) {
        assert_eq!(RoleEnforcer::new().grant(action, role), expected);
    }

    #[tokio::test]
    async fn test_user_edit_requires_membership() {
        let enforcer = RoleEnforcer::new();
        let outsider = FixedMembership { member: false, users: 1 };
        let member = FixedMembership { member: true, users: 1 };

        let err = enforcer
            .authorize(&ctx(Role::User), ActionCategory::EditProjectResource, &outsider)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        assert!(enforcer
            .authorize(&ctx(Role::User), ActionCategory::EditProjectResource, &member)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_setup_mode_needs_empty_store() {
        let enforcer = RoleEnforcer::new();
        let bootstrap = RequestContext::bootstrap("root@acme.io", "acme").unwrap();

        let empty = FixedMembership { member: false, users: 0 };
        let populated = FixedMembership { member: false, users: 3 };

        assert!(enforcer.is_setup_mode(&bootstrap, &empty).await.unwrap());
        assert!(!enforcer.is_setup_mode(&bootstrap, &populated).await.unwrap());
        assert!(!enforcer.is_setup_mode(&ctx(Role::CloudAdmin), &empty).await.unwrap());
    }

    #[test]
    fn test_scope_overrides() {
        let enforcer = RoleEnforcer::new();

        assert_eq!(enforcer.normalized_org(&ctx(Role::CloudAdmin), Some("Other")).unwrap(), "other");
        assert_eq!(enforcer.normalized_org(&ctx(Role::OrgAdmin), Some("other")).unwrap(), "acme");

        assert_eq!(enforcer.normalized_project(&ctx(Role::OrgAdmin), Some("Prod")).unwrap(), "prod");
        assert_eq!(enforcer.normalized_project(&ctx(Role::User), Some("prod")).unwrap(), "default");
        assert_eq!(enforcer.normalized_project(&ctx(Role::User), None).unwrap(), "default");
    }

    #[test]
    fn test_role_normalization() {
        let enforcer = RoleEnforcer::new();
        assert_eq!(enforcer.normalized_role(&ctx(Role::CloudAdmin), "cloudadmin"), Role::CloudAdmin);
        assert_eq!(enforcer.normalized_role(&ctx(Role::OrgAdmin), "orgadmin"), Role::OrgAdmin);
        assert_eq!(enforcer.normalized_role(&ctx(Role::OrgAdmin), "cloudadmin"), Role::User);
        assert_eq!(enforcer.normalized_role(&ctx(Role::User), "orgadmin"), Role::User);
        assert_eq!(enforcer.normalized_role(&ctx(Role::CloudAdmin), "root"), Role::User);
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop_oneof![Just(Role::User), Just(Role::OrgAdmin), Just(Role::CloudAdmin)]
    }

    proptest! {
        #[test]
        fn normalized_role_never_exceeds_caller(caller in any_role(), requested in "[a-zA-Z]{0,12}") {
            let enforcer = RoleEnforcer::new();
            let granted = enforcer.normalized_role(&ctx(caller), &requested);
            prop_assert!(granted <= caller);
        }

        #[test]
        fn cloud_admin_passes_every_check(index in 0usize..8) {
            let enforcer = RoleEnforcer::new();
            prop_assert!(enforcer.check_access(ActionCategory::ALL[index], Role::CloudAdmin));
        }
    }
}

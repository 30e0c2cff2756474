//! Per-request caller context
//!
//! A [`RequestContext`] is built once at the top of a request and handed by
//! reference to every store, role and workflow call. Nothing in the crate
//! keeps caller identity in shared state.

use crate::config::{BACKBONE_VNET_SUFFIX, DEFAULT_PROJECT_NAME};
use crate::error::NimbusResult;
use crate::types::{normalize_name, Role, ScopedId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub role: Role,
    pub org: String,
    pub project: String,
    /// Caller asked to bootstrap an empty cloud
    pub setup: bool,
}

impl RequestContext {
    pub fn new(user_id: &str, role: Role, org: &str, project: &str) -> NimbusResult<Self> {
        Ok(Self {
            user_id: user_id.trim().to_lowercase(),
            role,
            org: normalize_name(org)?,
            project: normalize_name(project)?,
            setup: false,
        })
    }

    /// Context for commands that run without an active project
    pub fn without_project(user_id: &str, role: Role, org: &str) -> NimbusResult<Self> {
        Self::new(user_id, role, org, DEFAULT_PROJECT_NAME)
    }

    /// Context used to create the very first cloud admin
    pub fn bootstrap(user_id: &str, org: &str) -> NimbusResult<Self> {
        let mut ctx = Self::without_project(user_id, Role::CloudAdmin, org)?;
        ctx.setup = true;
        Ok(ctx)
    }

    pub fn is_cloud_admin(&self) -> bool {
        self.role == Role::CloudAdmin
    }

    pub fn is_org_admin(&self) -> bool {
        self.role == Role::OrgAdmin
    }

    /// Resolve a caller supplied name inside the active org and project
    pub fn scoped(&self, name: &str) -> NimbusResult<ScopedId> {
        ScopedId::new(&self.org, &self.project, name)
    }

    /// Local name of this project's public IP backbone network
    pub fn backbone_vnet_name(&self) -> String {
        format!("{}-{}-{}", self.org, self.project, BACKBONE_VNET_SUFFIX)
    }

    pub fn backbone_vnet(&self) -> NimbusResult<ScopedId> {
        self.scoped(&self.backbone_vnet_name())
    }

    /// Same caller, different active project
    pub fn with_project(&self, org: &str, project: &str) -> NimbusResult<Self> {
        Ok(Self {
            org: normalize_name(org)?,
            project: normalize_name(project)?,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_normalizes_scope() {
        let ctx = RequestContext::new("Alice@Example.com", Role::User, "ACME", "Default").unwrap();
        assert_eq!(ctx.user_id, "alice@example.com");
        assert_eq!(ctx.org, "acme");
        assert_eq!(ctx.project, "default");
        assert_eq!(ctx.scoped("Web1").unwrap().to_string(), "acme_default_web1");
    }

    #[test]
    fn test_backbone_is_per_project() {
        let a = RequestContext::new("a@x", Role::User, "acme", "default").unwrap();
        let b = RequestContext::new("a@x", Role::User, "acme", "staging").unwrap();
        assert_eq!(a.backbone_vnet_name(), "acme-default-internet-backbone");
        assert_ne!(a.backbone_vnet().unwrap(), b.backbone_vnet().unwrap());
    }
}

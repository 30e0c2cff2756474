//! Users, projects and project memberships

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{membership_key, normalize_name, Project, User, KEY_SEPARATOR};

/// Row of the user × project mapping table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProjectMembership {
    user_id: String,
    org: String,
    project: String,
}

fn user_prefix(user_id: &str) -> String {
    format!("{user_id}{}", KEY_SEPARATOR)
}

fn normalize_user_id(raw: &str) -> NimbusResult<String> {
    let id = raw.trim().to_lowercase();
    if id.is_empty() {
        return Err(NimbusError::validation("user", "must not be empty"));
    }
    Ok(id)
}

impl ResourceStore {
    /// Users in the whole cloud, read without any role check
    pub async fn count_users(&self) -> NimbusResult<u64> {
        Ok(self.backend().scan(Table::Users, "").await?.len() as u64)
    }

    /// Raw membership test, read without any role check
    pub async fn membership_exists(&self, user_id: &str, org: &str, project: &str) -> NimbusResult<bool> {
        Ok(self
            .backend()
            .get(Table::ProjectUserMappings, &membership_key(user_id, org, project))
            .await?
            .is_some())
    }

    fn check_org(&self, ctx: &RequestContext, org: &str) -> NimbusResult<()> {
        if org != ctx.org && !ctx.is_cloud_admin() {
            return Err(NimbusError::unauthorized(format!("org {}", org)));
        }
        Ok(())
    }

    pub async fn get_user(&self, ctx: &RequestContext, user_id: &str) -> NimbusResult<Option<User>> {
        let user_id = normalize_user_id(user_id)?;
        if user_id != ctx.user_id {
            self.authorize(ctx, ActionCategory::LookupOrg).await?;
        }
        let user: Option<User> = self.load(Table::Users, &user_id).await?;
        if let Some(user) = &user {
            if user.id != ctx.user_id {
                self.check_org(ctx, &user.org)?;
            }
        }
        Ok(user)
    }

    /// Register a user; the first user of an empty cloud needs no grant
    pub async fn add_user(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        name: &str,
        org: Option<&str>,
        role: &str,
    ) -> NimbusResult<User> {
        if !self.enforcer().is_setup_mode(ctx, self).await? {
            self.authorize(ctx, ActionCategory::AddUserToOrg).await?;
        }

        let user = User {
            id: normalize_user_id(user_id)?,
            name: name.trim().to_string(),
            org: self.enforcer().normalized_org(ctx, org)?,
            role: self.enforcer().normalized_role(ctx, role),
        };
        let inserted = self
            .backend()
            .execute(StoreOp::insert(Table::Users, user.id.clone(), Self::encode(&user)?))
            .await?;
        if !inserted {
            return Err(NimbusError::already_exists(format!("user {}", user.id)));
        }
        info!(user = %user.id, org = %user.org, role = %user.role, "Added user");
        Ok(user)
    }

    /// Delete a user and every project membership it holds
    pub async fn delete_user(&self, ctx: &RequestContext, user_id: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let user_id = normalize_user_id(user_id)?;
        let Some(user) = self.load::<User>(Table::Users, &user_id).await? else {
            return Ok(false);
        };
        self.check_org(ctx, &user.org)?;
        if user.role > ctx.role {
            return Err(NimbusError::unauthorized(format!("delete of {} {}", user.role, user.id)));
        }

        self.commit(
            vec![
                StoreOp::delete(Table::Users, user_id.clone()),
                StoreOp::delete_prefix(Table::ProjectUserMappings, user_prefix(&user_id)),
            ],
            || NimbusError::internal("user delete transaction conflicted"),
        )
        .await?;
        info!(user = %user_id, "Deleted user");
        Ok(true)
    }

    /// Change the role of a user in the caller's org
    pub async fn change_user_role(&self, ctx: &RequestContext, user_id: &str, role: &str) -> NimbusResult<User> {
        if !(ctx.is_cloud_admin() || ctx.is_org_admin()) {
            return Err(NimbusError::unauthorized("change user role"));
        }
        let user_id = normalize_user_id(user_id)?;
        let mut user = self
            .load::<User>(Table::Users, &user_id)
            .await?
            .ok_or_else(|| NimbusError::not_found(format!("user {}", user_id)))?;
        self.check_org(ctx, &user.org)?;
        if user.role > ctx.role {
            return Err(NimbusError::unauthorized(format!("role change of {}", user.id)));
        }

        user.role = self.enforcer().normalized_role(ctx, role);
        self.save(Table::Users, &user.id, &user).await?;
        Ok(user)
    }

    pub async fn list_users(&self, ctx: &RequestContext, org: Option<&str>) -> NimbusResult<Vec<User>> {
        self.authorize(ctx, ActionCategory::LookupOrg).await?;
        let org = self.enforcer().normalized_org(ctx, org)?;
        let users: Vec<User> = self.load_prefix(Table::Users, "").await?;
        Ok(users.into_iter().filter(|user| user.org == org).collect())
    }

    /// Create a project in the caller's org; `false` when it already exists
    pub async fn add_project(&self, ctx: &RequestContext, name: &str, description: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditOrg).await?;
        let project = Project {
            name: normalize_name(name)?,
            org: ctx.org.clone(),
            description: description.to_string(),
        };
        self.backend()
            .execute(StoreOp::insert(
                Table::Projects,
                Project::storage_key(&project.org, &project.name),
                Self::encode(&project)?,
            ))
            .await
    }

    pub async fn get_project(&self, ctx: &RequestContext, org: &str, name: &str) -> NimbusResult<Option<Project>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        let org = normalize_name(org)?;
        self.check_org(ctx, &org)?;
        self.load(Table::Projects, &Project::storage_key(&org, &normalize_name(name)?))
            .await
    }

    pub async fn list_projects(&self, ctx: &RequestContext, org: Option<&str>) -> NimbusResult<Vec<Project>> {
        self.authorize(ctx, ActionCategory::LookupOrg).await?;
        let org = self.enforcer().normalized_org(ctx, org)?;
        self.load_prefix(Table::Projects, &format!("{org}{}", KEY_SEPARATOR))
            .await
    }

    /// Delete a project of the caller's org and all of its memberships
    pub async fn delete_project(&self, ctx: &RequestContext, name: &str) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditOrg).await?;
        let name = normalize_name(name)?;
        let key = Project::storage_key(&ctx.org, &name);
        if self.load::<Project>(Table::Projects, &key).await?.is_none() {
            return Ok(false);
        }

        let memberships: Vec<ProjectMembership> =
            self.load_prefix(Table::ProjectUserMappings, "").await?;
        let mut ops = vec![StoreOp::delete(Table::Projects, key)];
        ops.extend(
            memberships
                .iter()
                .filter(|m| m.org == ctx.org && m.project == name)
                .map(|m| {
                    StoreOp::delete(
                        Table::ProjectUserMappings,
                        membership_key(&m.user_id, &m.org, &m.project),
                    )
                }),
        );
        self.commit(ops, || NimbusError::internal("project delete transaction conflicted"))
            .await?;
        info!(org = %ctx.org, project = %name, "Deleted project");
        Ok(true)
    }

    pub async fn add_user_to_project(&self, ctx: &RequestContext, user_id: &str, project: &str) -> NimbusResult<()> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let membership = self.resolve_membership(ctx, user_id, project).await?;
        self.save(
            Table::ProjectUserMappings,
            &membership_key(&membership.user_id, &membership.org, &membership.project),
            &membership,
        )
        .await
    }

    pub async fn remove_user_from_project(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        project: &str,
    ) -> NimbusResult<bool> {
        self.authorize(ctx, ActionCategory::EditProjectResource).await?;
        let membership = self.resolve_membership(ctx, user_id, project).await?;
        self.backend()
            .execute(StoreOp::delete(
                Table::ProjectUserMappings,
                membership_key(&membership.user_id, &membership.org, &membership.project),
            ))
            .await
    }

    async fn resolve_membership(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        project: &str,
    ) -> NimbusResult<ProjectMembership> {
        let project = normalize_name(project)?;
        if self
            .load::<Project>(Table::Projects, &Project::storage_key(&ctx.org, &project))
            .await?
            .is_none()
        {
            return Err(NimbusError::not_found(format!("project {}", project)));
        }
        Ok(ProjectMembership {
            user_id: normalize_user_id(user_id)?,
            org: ctx.org.clone(),
            project,
        })
    }

    /// Projects a user belongs to; anyone but the user needs lookup rights
    pub async fn user_projects(&self, ctx: &RequestContext, user_id: &str) -> NimbusResult<Vec<Project>> {
        let user_id = normalize_user_id(user_id)?;
        if user_id != ctx.user_id {
            self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        }
        let memberships: Vec<ProjectMembership> = self
            .load_prefix(Table::ProjectUserMappings, &user_prefix(&user_id))
            .await?;

        let mut projects = Vec::with_capacity(memberships.len());
        for membership in memberships {
            if membership.org != ctx.org && !ctx.is_cloud_admin() {
                continue;
            }
            let key = Project::storage_key(&membership.org, &membership.project);
            if let Some(project) = self.load::<Project>(Table::Projects, &key).await? {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    pub async fn project_members(&self, ctx: &RequestContext) -> NimbusResult<Vec<String>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        let memberships: Vec<ProjectMembership> =
            self.load_prefix(Table::ProjectUserMappings, "").await?;
        Ok(memberships
            .into_iter()
            .filter(|m| m.org == ctx.org && m.project == ctx.project)
            .map(|m| m.user_id)
            .collect())
    }
}


//! Org, project and user workflows

use tracing::{info, instrument, warn};

use super::{Orchestrator, Saga};
use crate::config::DEFAULT_PROJECT_NAME;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::ActionCategory;
use crate::types::{Project, User};

impl Orchestrator {
    /// Create the default project of the caller's org
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id, org = %ctx.org))]
    pub async fn init_org(&self, ctx: &RequestContext) -> NimbusResult<bool> {
        self.store.authorize(ctx, ActionCategory::EditOrg).await?;
        let description = format!("Default project for org {}", ctx.org);
        self.add_project(ctx, DEFAULT_PROJECT_NAME, &description)
            .await
    }

    /// Create a project and make the caller a member
    ///
    /// Returns `false` when the project already existed. The project is
    /// deleted again if the caller cannot be added to it.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id, org = %ctx.org))]
    pub async fn add_project(&self, ctx: &RequestContext, name: &str, description: &str) -> NimbusResult<bool> {
        let mut saga = Saga::new("add_project");
        let created = saga
            .run("record project", self.store.add_project(ctx, name, description))
            .await?;
        if !created {
            warn!(project = name, "Project already exists");
            return Ok(false);
        }
        saga.compensate_with("record project", async {
            self.store.delete_project(ctx, name).await.map(|_| ())
        });

        saga.run(
            "add creator",
            self.store.add_user_to_project(ctx, &ctx.user_id, name),
        )
        .await?;
        saga.complete();
        info!(project = name, "Added project");
        Ok(true)
    }

    /// Delete a project; cloud admins may name another org
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn delete_project(
        &self,
        ctx: &RequestContext,
        name: Option<&str>,
        org: Option<&str>,
    ) -> NimbusResult<bool> {
        let org = self.store.enforcer().normalized_org(ctx, org)?;
        let project = self.store.enforcer().normalized_project(ctx, name)?;
        let scoped = ctx.with_project(&org, &project)?;
        self.store.delete_project(&scoped, &project).await
    }

    pub async fn add_user(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        name: &str,
        org: Option<&str>,
        role: Option<&str>,
    ) -> NimbusResult<User> {
        self.store
            .add_user(ctx, user_id, name, org, role.unwrap_or("user"))
            .await
    }

    pub async fn delete_user(&self, ctx: &RequestContext, user_id: &str, org: Option<&str>) -> NimbusResult<()> {
        let org = self.store.enforcer().normalized_org(ctx, org)?;
        let scoped = ctx.with_project(&org, &ctx.project)?;
        if !self.store.delete_user(&scoped, user_id).await? {
            return Err(NimbusError::not_found(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// Add a user to a project; only admins may name a project other than the active one
    ///
    /// Returns `false` when the user already was a member.
    pub async fn add_user_to_project(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        project: Option<&str>,
    ) -> NimbusResult<bool> {
        let project = self.store.enforcer().normalized_project(ctx, project)?;
        let user = user_id.trim().to_lowercase();
        if self.store.membership_exists(&user, &ctx.org, &project).await? {
            self.store
                .authorize(ctx, ActionCategory::EditProjectResource)
                .await?;
            warn!(user = %user, project = %project, "User already belongs to the project");
            return Ok(false);
        }
        self.store.add_user_to_project(ctx, &user, &project).await?;
        info!(user = %user, project = %project, "Added user to project");
        Ok(true)
    }

    pub async fn delete_user_from_project(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        project: Option<&str>,
        org: Option<&str>,
    ) -> NimbusResult<bool> {
        let org = self.store.enforcer().normalized_org(ctx, org)?;
        let project = self.store.enforcer().normalized_project(ctx, project)?;
        let scoped = ctx.with_project(&org, &ctx.project)?;
        self.store
            .remove_user_from_project(&scoped, user_id, &project)
            .await
    }

    /// Projects the caller belongs to
    pub async fn get_user_projects(&self, ctx: &RequestContext) -> NimbusResult<Vec<Project>> {
        self.store.user_projects(ctx, &ctx.user_id).await
    }

    pub async fn change_user_role(&self, ctx: &RequestContext, user_id: &str, role: &str) -> NimbusResult<User> {
        let user = self.store.change_user_role(ctx, user_id, role).await?;
        info!(user = %user.id, role = %user.role, "Changed user role");
        Ok(user)
    }
}

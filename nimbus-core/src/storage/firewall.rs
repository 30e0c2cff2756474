//! Firewall ruleset rows

use super::{ResourceStore, StoreOp, Table};
use crate::context::RequestContext;
use crate::error::NimbusResult;
use crate::roles::ActionCategory;
use crate::types::{FirewallRuleset, ScopedId};

impl ResourceStore {
    pub async fn put_ruleset(&self, ctx: &RequestContext, ruleset: &FirewallRuleset) -> NimbusResult<()> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, &ruleset.id)
            .await?;
        self.save(Table::FirewallRulesets, &ruleset.id.storage_key(), ruleset)
            .await
    }

    pub async fn get_ruleset(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<Option<FirewallRuleset>> {
        self.authorize_scoped(ctx, ActionCategory::LookupProjectResource, id)
            .await?;
        self.load(Table::FirewallRulesets, &id.storage_key()).await
    }

    pub async fn list_rulesets(&self, ctx: &RequestContext) -> NimbusResult<Vec<FirewallRuleset>> {
        self.authorize(ctx, ActionCategory::LookupProjectResource).await?;
        self.load_prefix(
            Table::FirewallRulesets,
            &ScopedId::scope_prefix(&ctx.org, &ctx.project),
        )
        .await
    }

    pub async fn delete_ruleset(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<bool> {
        self.authorize_scoped(ctx, ActionCategory::EditProjectResource, id)
            .await?;
        self.backend()
            .execute(StoreOp::delete(Table::FirewallRulesets, id.storage_key()))
            .await
    }
}

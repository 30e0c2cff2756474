//! Resource store
//!
//! Typed CRUD and graph operations over the control plane's tables. Every
//! operation checks the caller against the [`RoleEnforcer`] before it reads
//! or writes, so no workflow can skip authorization by skipping a call.
//! Scoped identifiers outside the caller's org or project are rejected
//! unless the caller's role may reach across.
//!
//! Records are bincode encoded. Host admin passwords are sealed on write and
//! opened on read, so callers only ever see plain text.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::config::NimbusConfig;
use crate::context::RequestContext;
use crate::error::{NimbusError, NimbusResult};
use crate::roles::{ActionCategory, MembershipLookup, RoleEnforcer};
use crate::types::ScopedId;

pub mod archive;
pub mod backend;
pub mod firewall;
pub mod hosts;
pub mod ips;
pub mod networks;
pub mod secrets;
pub mod tenancy;
pub mod vms;

pub use backend::{RedbBackend, StoreBackend, StoreOp, Table};
pub use hosts::CapacityRequest;
pub use secrets::SecretCipher;

/// Persistence facade shared by every component
pub struct ResourceStore {
    backend: Arc<dyn StoreBackend>,
    enforcer: RoleEnforcer,
    cipher: SecretCipher,
}

impl ResourceStore {
    pub fn new(backend: Arc<dyn StoreBackend>, cipher: SecretCipher) -> Self {
        Self {
            backend,
            enforcer: RoleEnforcer::new(),
            cipher,
        }
    }

    /// Open the configured database, reading the master key from the environment
    pub fn open(config: &NimbusConfig) -> NimbusResult<Self> {
        let backend = RedbBackend::open(&config.storage.database_path)?;
        let cipher = SecretCipher::from_env(&config.security.master_key_env)?;
        Ok(Self::new(Arc::new(backend), cipher))
    }

    /// In-memory store with a random key
    pub fn in_memory() -> NimbusResult<Self> {
        Ok(Self::new(
            Arc::new(RedbBackend::in_memory()?),
            SecretCipher::generate(),
        ))
    }

    pub fn enforcer(&self) -> &RoleEnforcer {
        &self.enforcer
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub(crate) fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    pub async fn authorize(&self, ctx: &RequestContext, action: ActionCategory) -> NimbusResult<()> {
        self.enforcer.authorize(ctx, action, self).await
    }

    /// Reject identifiers outside the caller's reach
    pub fn check_scope(&self, ctx: &RequestContext, id: &ScopedId) -> NimbusResult<()> {
        let foreign_org = id.org() != ctx.org && !ctx.is_cloud_admin();
        let foreign_project =
            id.project() != ctx.project && !(ctx.is_cloud_admin() || ctx.is_org_admin());
        if foreign_org || foreign_project {
            tracing::warn!(user = %ctx.user_id, resource = %id, "Out of scope resource access");
            return Err(NimbusError::unauthorized(format!("scope of {}", id)));
        }
        Ok(())
    }

    pub(crate) async fn authorize_scoped(
        &self,
        ctx: &RequestContext,
        action: ActionCategory,
        id: &ScopedId,
    ) -> NimbusResult<()> {
        self.authorize(ctx, action).await?;
        self.check_scope(ctx, id)
    }

    pub(crate) fn encode<T: Serialize>(value: &T) -> NimbusResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NimbusResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub(crate) async fn load<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
    ) -> NimbusResult<Option<T>> {
        match self.backend.get(table, key).await? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn load_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> NimbusResult<Vec<T>> {
        self.backend
            .scan(table, prefix)
            .await?
            .iter()
            .map(|(_, bytes)| Self::decode(bytes))
            .collect()
    }

    pub(crate) async fn save<T: Serialize>(
        &self,
        table: Table,
        key: &str,
        value: &T,
    ) -> NimbusResult<()> {
        self.backend
            .execute(StoreOp::put(table, key, Self::encode(value)?))
            .await?;
        Ok(())
    }

    /// Run a multi-statement change; an insert on a taken key fails with `conflict`
    pub(crate) async fn commit(
        &self,
        ops: Vec<StoreOp>,
        conflict: impl FnOnce() -> NimbusError,
    ) -> NimbusResult<()> {
        if self.backend.transaction(ops).await? {
            Ok(())
        } else {
            Err(conflict())
        }
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("enforcer", &self.enforcer)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MembershipLookup for ResourceStore {
    async fn is_project_member(
        &self,
        user_id: &str,
        org: &str,
        project: &str,
    ) -> NimbusResult<bool> {
        self.membership_exists(user_id, org, project).await
    }

    async fn user_count(&self) -> NimbusResult<u64> {
        self.count_users().await
    }
}

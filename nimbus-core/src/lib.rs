//! Nimbus control plane core
//!
//! Role enforcement, the resource store, host placement, the VxLAN mesh
//! manager and the provisioning workflows of a multi-tenant hybrid cloud.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod failpoints;
pub mod host_chooser;
pub mod remote;
pub mod roles;
pub mod storage;
pub mod types;
pub mod vnet;
pub mod workflows;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::NimbusConfig;
pub use context::RequestContext;
pub use dispatcher::{Caller, Dispatcher};
pub use error::{NimbusError, NimbusResult};
pub use storage::ResourceStore;
pub use workflows::{CommandResult, Orchestrator};

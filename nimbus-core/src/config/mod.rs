//! Configuration module for Nimbus
//!
//! Configuration is read from a TOML file, overridden by `NIMBUS_*`
//! environment variables, and validated before any component starts.
//! Every section falls back to the constants in [`defaults`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{NimbusError, NimbusResult};

pub mod defaults;
pub mod dispatcher;
pub mod placement;
pub mod provisioning;
pub mod remote;
pub mod storage;

pub use defaults::*;
pub use dispatcher::DispatcherConfig;
pub use placement::PlacementConfig;
pub use provisioning::ProvisioningConfig;
pub use remote::RemoteConfig;
pub use storage::{SecurityConfig, StorageConfig};

/// Root configuration structure for Nimbus
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NimbusConfig {
    /// Host chooser oversubscription factors
    pub placement: PlacementConfig,

    /// Workflow defaults (multipliers, DNS, MTU, segment ids)
    pub provisioning: ProvisioningConfig,

    /// Command timeout and duplicate suppression
    pub dispatcher: DispatcherConfig,

    pub storage: StorageConfig,

    pub remote: RemoteConfig,

    pub security: SecurityConfig,
}

impl NimbusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> NimbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            NimbusError::configuration(
                "config_file",
                format!("Failed to read {}: {}", path.display(), e),
            )
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> NimbusResult<Self> {
        let config = Self {
            placement: PlacementConfig::from_env()?,
            provisioning: ProvisioningConfig::from_env()?,
            dispatcher: DispatcherConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            remote: RemoteConfig::from_env()?,
            security: SecurityConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> NimbusResult<()> {
        self.placement.validate()?;
        self.provisioning.validate()?;
        self.dispatcher.validate()?;
        self.storage.validate()?;
        self.remote.validate()?;
        self.security.validate()?;
        Ok(())
    }

    /// Configuration for tests: short timeouts, quick guest checks
    pub fn test() -> Self {
        let mut config = Self::default();
        config.dispatcher.command_timeout = Duration::from_secs(5);
        config.dispatcher.duplicate_check_window = Duration::from_secs(1);
        config.provisioning.max_guest_agent_check_wait = Duration::from_secs(1);
        config.provisioning.default_vm_shutdown_wait = Duration::from_secs(1);
        config
    }
}

/// Builder for NimbusConfig
pub struct NimbusConfigBuilder {
    config: NimbusConfig,
}

impl NimbusConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NimbusConfig::default(),
        }
    }

    pub fn placement(mut self, placement: PlacementConfig) -> Self {
        self.config.placement = placement;
        self
    }

    pub fn provisioning(mut self, provisioning: ProvisioningConfig) -> Self {
        self.config.provisioning = provisioning;
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.config.dispatcher = dispatcher;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = remote;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    pub fn build(self) -> NimbusResult<NimbusConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for NimbusConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an optional environment variable into `T`
pub(crate) fn parse_env<T: FromStr>(key: &str) -> NimbusResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| NimbusError::configuration(key, format!("Invalid value '{}'", value))),
        Err(_) => Ok(None),
    }
}

pub(crate) fn parse_secs_env(key: &str, default: Duration) -> NimbusResult<Duration> {
    Ok(parse_env::<u64>(key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_validation() {
        let config = NimbusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.placement.vcpu_to_physical_cpu_factor, 4.0);
        assert_eq!(config.provisioning.first_vnet_number, 10);
        assert_eq!(config.provisioning.default_host_network, "kddefault");
    }

    #[test]
    fn test_config_builder() {
        let config = NimbusConfigBuilder::new()
            .placement(PlacementConfig {
                vcpu_to_physical_cpu_factor: 2.0,
                vmem_to_physical_mem_factor: 1.5,
            })
            .build()
            .unwrap();

        assert_eq!(config.placement.vcpu_to_physical_cpu_factor, 2.0);
        assert_eq!(config.placement.vmem_to_physical_mem_factor, 1.5);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = NimbusConfig::default();
        config.placement.vcpu_to_physical_cpu_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = NimbusConfig::default();
        config.provisioning.default_dns1 = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_sections_fall_back_to_defaults() {
        let config: NimbusConfig = toml::from_str(
            r#"
            [placement]
            vcpu_to_physical_cpu_factor = 8.0

            [dispatcher]
            command_timeout = "2m"
            "#,
        )
        .unwrap();

        assert_eq!(config.placement.vcpu_to_physical_cpu_factor, 8.0);
        assert_eq!(config.placement.vmem_to_physical_mem_factor, 1.0);
        assert_eq!(config.dispatcher.command_timeout, Duration::from_secs(120));
        assert!(config.dispatcher.duplicate_check_enabled);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nimbus.toml");
        std::fs::write(&path, "[provisioning]\nfirst_vnet_number = 100\n").unwrap();

        let config = NimbusConfig::from_file(&path).unwrap();
        assert_eq!(config.provisioning.first_vnet_number, 100);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("NIMBUS_VM_MTU", "1400");
        std::env::set_var("NIMBUS_COMMAND_TIMEOUT_SECS", "42");
        let config = NimbusConfig::from_env();
        std::env::remove_var("NIMBUS_VM_MTU");
        std::env::remove_var("NIMBUS_COMMAND_TIMEOUT_SECS");

        let config = config.unwrap();
        assert_eq!(config.provisioning.default_vm_mtu, 1400);
        assert_eq!(config.dispatcher.command_timeout, Duration::from_secs(42));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("NIMBUS_MAX_CORES_MULTIPLIER", "many");
        let result = NimbusConfig::from_env();
        std::env::remove_var("NIMBUS_MAX_CORES_MULTIPLIER");
        assert!(matches!(
            result,
            Err(NimbusError::ConfigurationError { .. })
        ));
    }
}

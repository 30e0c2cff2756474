//! Provisioning workflow configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::*;
use super::{parse_env, parse_secs_env};
use crate::error::{NimbusError, NimbusResult};

/// Knobs used by the VM, IP and network workflows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// `max_cores` = cores × this, unless the caller asks for more
    pub max_cores_multiplier: u32,

    /// `max_memory` = memory × this, unless the caller asks for more
    pub max_memory_multiplier: u32,

    /// How long a rename waits for the guest to shut down
    #[serde(with = "humantime_serde")]
    pub default_vm_shutdown_wait: Duration,

    /// Budget handed to the guest agent liveness check
    #[serde(with = "humantime_serde")]
    pub max_guest_agent_check_wait: Duration,

    pub default_vm_mtu: u32,
    pub default_dns1: String,
    pub default_dns2: String,

    /// Host bridge used for VM NICs unless a cloud admin picks another
    pub default_host_network: String,

    /// First VxLAN segment id handed out to new networks
    pub first_vnet_number: u32,

    /// Largest CIDR range, in addresses, that one `addHostIP` may add
    pub max_ip_range_hosts: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_cores_multiplier: DEFAULT_MAX_CORES_MULTIPLIER,
            max_memory_multiplier: DEFAULT_MAX_MEMORY_MULTIPLIER,
            default_vm_shutdown_wait: Duration::from_secs(DEFAULT_VM_SHUTDOWN_WAIT_SECS),
            max_guest_agent_check_wait: Duration::from_secs(
                DEFAULT_MAX_GUEST_AGENT_CHECK_WAIT_SECS,
            ),
            default_vm_mtu: DEFAULT_VM_MTU,
            default_dns1: DEFAULT_DNS1.to_string(),
            default_dns2: DEFAULT_DNS2.to_string(),
            default_host_network: DEFAULT_HOST_NETWORK.to_string(),
            first_vnet_number: DEFAULT_FIRST_VNET_NUMBER,
            max_ip_range_hosts: DEFAULT_MAX_IP_RANGE_HOSTS,
        }
    }
}

impl ProvisioningConfig {
    pub fn from_env() -> NimbusResult<Self> {
        let mut config = Self::default();
        if let Some(value) = parse_env("NIMBUS_MAX_CORES_MULTIPLIER")? {
            config.max_cores_multiplier = value;
        }
        if let Some(value) = parse_env("NIMBUS_MAX_MEMORY_MULTIPLIER")? {
            config.max_memory_multiplier = value;
        }
        config.default_vm_shutdown_wait =
            parse_secs_env("NIMBUS_VM_SHUTDOWN_WAIT_SECS", config.default_vm_shutdown_wait)?;
        config.max_guest_agent_check_wait = parse_secs_env(
            "NIMBUS_GUEST_AGENT_CHECK_WAIT_SECS",
            config.max_guest_agent_check_wait,
        )?;
        if let Some(value) = parse_env("NIMBUS_VM_MTU")? {
            config.default_vm_mtu = value;
        }
        if let Ok(value) = std::env::var("NIMBUS_DNS1") {
            config.default_dns1 = value;
        }
        if let Ok(value) = std::env::var("NIMBUS_DNS2") {
            config.default_dns2 = value;
        }
        if let Ok(value) = std::env::var("NIMBUS_HOST_NETWORK") {
            config.default_host_network = value;
        }
        if let Some(value) = parse_env("NIMBUS_FIRST_VNET_NUMBER")? {
            config.first_vnet_number = value;
        }
        if let Some(value) = parse_env("NIMBUS_MAX_IP_RANGE_HOSTS")? {
            config.max_ip_range_hosts = value;
        }
        Ok(config)
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if self.max_cores_multiplier == 0 || self.max_memory_multiplier == 0 {
            return Err(NimbusError::configuration(
                "provisioning",
                "max cores/memory multipliers must be at least 1",
            ));
        }
        if self.default_vm_mtu < 576 {
            return Err(NimbusError::configuration(
                "provisioning.default_vm_mtu",
                format!("MTU {} is below the IPv4 minimum of 576", self.default_vm_mtu),
            ));
        }
        for (field, dns) in [
            ("provisioning.default_dns1", &self.default_dns1),
            ("provisioning.default_dns2", &self.default_dns2),
        ] {
            dns.parse::<std::net::IpAddr>()
                .map_err(|e| NimbusError::configuration(field, e.to_string()))?;
        }
        if self.max_ip_range_hosts == 0 {
            return Err(NimbusError::configuration(
                "provisioning.max_ip_range_hosts",
                "must be at least 1",
            ));
        }
        if self.default_host_network.trim().is_empty() {
            return Err(NimbusError::configuration(
                "provisioning.default_host_network",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

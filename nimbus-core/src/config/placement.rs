//! Placement configuration

use serde::{Deserialize, Serialize};

use super::defaults::*;
use super::parse_env;
use crate::error::{NimbusError, NimbusResult};

/// Oversubscription factors used by the host chooser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Virtual CPUs sold per physical core
    pub vcpu_to_physical_cpu_factor: f64,

    /// Virtual memory sold per byte of physical memory
    pub vmem_to_physical_mem_factor: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            vcpu_to_physical_cpu_factor: DEFAULT_VCPU_TO_PHYSICAL_CPU_FACTOR,
            vmem_to_physical_mem_factor: DEFAULT_VMEM_TO_PHYSICAL_MEM_FACTOR,
        }
    }
}

impl PlacementConfig {
    pub fn from_env() -> NimbusResult<Self> {
        let mut config = Self::default();
        if let Some(factor) = parse_env("NIMBUS_VCPU_TO_PHYSICAL_CPU_FACTOR")? {
            config.vcpu_to_physical_cpu_factor = factor;
        }
        if let Some(factor) = parse_env("NIMBUS_VMEM_TO_PHYSICAL_MEM_FACTOR")? {
            config.vmem_to_physical_mem_factor = factor;
        }
        Ok(config)
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if !(self.vcpu_to_physical_cpu_factor > 0.0) {
            return Err(NimbusError::configuration(
                "placement.vcpu_to_physical_cpu_factor",
                "must be greater than zero",
            ));
        }
        if !(self.vmem_to_physical_mem_factor > 0.0) {
            return Err(NimbusError::configuration(
                "placement.vmem_to_physical_mem_factor",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

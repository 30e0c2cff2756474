//! Default configuration values for Nimbus
//!
//! This module centralizes all default values to make them easy to find and modify.

// Placement defaults
pub const DEFAULT_VCPU_TO_PHYSICAL_CPU_FACTOR: f64 = 4.0;
pub const DEFAULT_VMEM_TO_PHYSICAL_MEM_FACTOR: f64 = 1.0;

// Provisioning defaults
pub const DEFAULT_MAX_CORES_MULTIPLIER: u32 = 4;
pub const DEFAULT_MAX_MEMORY_MULTIPLIER: u32 = 4;
pub const DEFAULT_VM_SHUTDOWN_WAIT_SECS: u64 = 90;
pub const DEFAULT_MAX_GUEST_AGENT_CHECK_WAIT_SECS: u64 = 60;
pub const DEFAULT_VM_MTU: u32 = 1200;
pub const DEFAULT_DNS1: &str = "8.8.8.8";
pub const DEFAULT_DNS2: &str = "4.4.4.4";
pub const DEFAULT_HOST_NETWORK: &str = "kddefault";
pub const DEFAULT_FIRST_VNET_NUMBER: u32 = 10;
pub const DEFAULT_MAX_IP_RANGE_HOSTS: u64 = 4096;
pub const DEFAULT_OS_TYPE: &str = "linux2018";
pub const DEFAULT_VM_TYPE: &str = "vm";
pub const DEFAULT_DISK_NAME: &str = "__org_kloudust_default_disk_name";

// Dispatcher defaults
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_DUPLICATE_CHECK_WINDOW_SECS: u64 = 30;

// Storage defaults
pub const DEFAULT_DATABASE_PATH: &str = "./data/nimbus.redb";

// Remote execution defaults
pub const DEFAULT_SCRIPT_DIR: &str = "./scripts";
pub const DEFAULT_REMOTE_RUNNER: &str = "sshpass";
/// `sshpass -e` reads the password from `SSHPASS`
pub const DEFAULT_REMOTE_RUNNER_ARGS: [&str; 2] = ["-e", "ssh"];
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 600; // 10 minutes

// Security defaults
pub const DEFAULT_MASTER_KEY_ENV: &str = "NIMBUS_MASTER_KEY";

// Tenancy defaults
pub const DEFAULT_PROJECT_NAME: &str = "default";
pub const BACKBONE_VNET_SUFFIX: &str = "internet-backbone";

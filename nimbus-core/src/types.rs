//! Core domain types for the Nimbus resource graph
//!
//! Every tenant-owned resource is addressed by a [`ScopedId`]. Hosts and host
//! resources are cloud-global and keyed by their plain name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{NimbusError, NimbusResult};

/// Separator between the parts of a canonical storage key
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Separator between the columns of a relationship edge key
pub const EDGE_SEPARATOR: char = '\u{1e}';

/// Case-fold a user supplied name the way every identifier is stored
///
/// Trims, lower-cases and turns each whitespace character into `_`. Names
/// containing control characters (which include both key separators) are
/// rejected.
pub fn normalize_name(raw: &str) -> NimbusResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NimbusError::validation("name", "must not be empty"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(NimbusError::validation(
            "name",
            format!("'{}' contains control characters", trimmed.escape_debug()),
        ));
    }
    Ok(trimmed
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect::<String>()
        .to_lowercase())
}

/// Identifier of a resource owned by an org and project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedId {
    org: String,
    project: String,
    name: String,
}

impl ScopedId {
    pub fn new(org: &str, project: &str, name: &str) -> NimbusResult<Self> {
        Ok(Self {
            org: normalize_name(org)?,
            project: normalize_name(project)?,
            name: normalize_name(name)?,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same scope, different local name
    pub fn sibling(&self, name: &str) -> NimbusResult<Self> {
        Ok(Self {
            org: self.org.clone(),
            project: self.project.clone(),
            name: normalize_name(name)?,
        })
    }

    /// Canonical encoding used as the key at the storage boundary
    pub fn storage_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.org,
            self.project,
            self.name,
            sep = KEY_SEPARATOR
        )
    }

    pub fn from_storage_key(key: &str) -> NimbusResult<Self> {
        let mut parts = key.split(KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(org), Some(project), Some(name), None)
                if !org.is_empty() && !project.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    org: org.to_string(),
                    project: project.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(NimbusError::validation(
                "storage_key",
                format!("'{}' is not a scoped key", key.escape_debug()),
            )),
        }
    }

    /// Key prefix matching every resource of one project
    pub fn scope_prefix(org: &str, project: &str) -> String {
        format!("{org}{sep}{project}{sep}", sep = KEY_SEPARATOR)
    }

    /// Key prefix matching every resource of one org
    pub fn org_prefix(org: &str) -> String {
        format!("{org}{}", KEY_SEPARATOR)
    }

    /// Name the host-side scripts know this resource by
    pub fn host_label(&self) -> String {
        format!("{}_{}_{}", self.name, self.org, self.project)
    }
}

impl fmt::Display for ScopedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.org, self.project, self.name)
    }
}

/// Caller privilege, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    OrgAdmin,
    CloudAdmin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::User, Role::OrgAdmin, Role::CloudAdmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::OrgAdmin => "orgadmin",
            Role::CloudAdmin => "cloudadmin",
        }
    }

    /// Parse a role name, treating anything unknown as `user`
    pub fn parse_lenient(raw: &str) -> Role {
        raw.parse().unwrap_or(Role::User)
    }
}

impl FromStr for Role {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "orgadmin" => Ok(Role::OrgAdmin),
            "cloudadmin" => Ok(Role::CloudAdmin),
            other => Err(NimbusError::validation("role", format!("unknown role '{other}'"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string that never shows up in `Debug` output or logs
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How the control plane logs into a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredentials {
    pub user: String,
    /// Plain text in memory; sealed by the store before it is written
    pub password: Secret,
    /// SSH host key, e.g. `ssh-ed25519 AAAA...`
    pub host_key: String,
    pub port: u16,
}

/// Physical capacity of a hypervisor host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostCapacity {
    pub cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_speed: u64,
    pub sockets: u32,
}

/// A hypervisor host in the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub address: String,
    pub host_type: String,
    pub credentials: HostCredentials,
    pub capacity: HostCapacity,
    pub processor: String,
    pub architecture: String,
    /// Reserved for one org; `None` means any unreserved tenant may land here
    pub org: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Host {
    pub fn access(&self) -> HostAccess {
        HostAccess {
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// Everything the remote executor needs to reach a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAccess {
    pub hostname: String,
    pub address: String,
    pub credentials: HostCredentials,
}

/// Image or ISO the VMs are built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResource {
    pub name: String,
    pub uri: String,
    pub architecture: String,
    pub description: String,
    /// `{osType}:{imageType}`
    pub extra_info: String,
    pub resource_type: String,
}

impl HostResource {
    pub fn os_type(&self) -> Option<&str> {
        self.extra_info
            .split(':')
            .next()
            .map(str::trim)
            .filter(|os| !os.is_empty())
    }

    pub fn image_type(&self) -> Option<&str> {
        self.extra_info
            .split(':')
            .nth(1)
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Installable ISOs cannot take cloud-init data
    pub fn is_cloud_image(&self) -> bool {
        !self
            .image_type()
            .map(|t| t.to_lowercase().ends_with("iso"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub size_gb: u64,
}

/// A virtual machine placed on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: ScopedId,
    /// Name as the caller typed it
    pub raw_name: String,
    pub description: String,
    pub hostname: String,
    pub os: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disks: Vec<Disk>,
    /// Audit trail of the command that created the VM
    pub creation_cmd: String,
    pub vm_type: String,
    /// Public IPs, in assignment order
    pub ips: Vec<IpAddr>,
}

impl Vm {
    pub fn ips_joined(&self) -> String {
        self.ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An overlay network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vnet {
    pub id: ScopedId,
    pub description: String,
    /// VxLAN segment id
    pub vnet_num: u32,
}

/// Terminating host of a public IP
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VtepHost {
    /// Terminates on whichever host runs the VM (`*`)
    SameAsVm,
    Host(String),
}

impl fmt::Display for VtepHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VtepHost::SameAsVm => f.write_str("*"),
            VtepHost::Host(hostname) => f.write_str(hostname),
        }
    }
}

impl FromStr for VtepHost {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(NimbusError::validation("hostname", "must not be empty")),
            "*" => Ok(VtepHost::SameAsVm),
            hostname => Ok(VtepHost::Host(hostname.to_string())),
        }
    }
}

/// Entry of the public IP pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: IpAddr,
    pub vtep: VtepHost,
    pub allocated_to: Option<ScopedId>,
}

impl IpEntry {
    pub fn is_free(&self) -> bool {
        self.allocated_to.is_none()
    }
}

/// Ordered list of firewall rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleset {
    pub id: ScopedId,
    pub description: String,
    rules_json: String,
}

impl FirewallRuleset {
    /// Rules must be a JSON array; declaration order is kept
    pub fn new(id: ScopedId, description: impl Into<String>, rules_json: &str) -> NimbusResult<Self> {
        let rules: serde_json::Value = serde_json::from_str(rules_json)?;
        if !rules.is_array() {
            return Err(NimbusError::validation(
                "rules",
                "firewall rules must be a JSON array",
            ));
        }
        Ok(Self {
            id,
            description: description.into(),
            rules_json: rules.to_string(),
        })
    }

    pub fn rules_json(&self) -> &str {
        &self.rules_json
    }

    /// Rules in host evaluation order: last declared is pushed first
    pub fn reversed_rules_json(&self) -> NimbusResult<String> {
        let mut rules: Vec<serde_json::Value> = serde_json::from_str(&self.rules_json)?;
        rules.reverse();
        Ok(serde_json::to_string(&rules)?)
    }
}

/// Kinds of typed edges in the relationships table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// vnet ↔ member host
    VnetHost,
    /// vnet ↔ attached VM
    VnetVm,
    /// VM ↔ vnet ↔ private IP
    VmVnetIp,
    /// VM ↔ vnet ↔ applied firewall ruleset
    VmVnetFirewall,
    /// snapshot ↔ resource
    Snapshot,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::VnetHost => "vnethost",
            RelationKind::VnetVm => "vnetvm",
            RelationKind::VmVnetIp => "vmvnetip",
            RelationKind::VmVnetFirewall => "vmvnetfw",
            RelationKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic typed edge between two or three identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationKind,
    pub pk1: String,
    pub pk2: String,
    pub pk3: Option<String>,
}

impl Relationship {
    pub fn new(kind: RelationKind, pk1: impl Into<String>, pk2: impl Into<String>) -> Self {
        Self {
            kind,
            pk1: pk1.into(),
            pk2: pk2.into(),
            pk3: None,
        }
    }

    pub fn with_pk3(mut self, pk3: impl Into<String>) -> Self {
        self.pk3 = Some(pk3.into());
        self
    }

    pub fn storage_key(&self) -> String {
        let mut key = Self::prefix(self.kind, Some(&self.pk1), Some(&self.pk2));
        if let Some(pk3) = &self.pk3 {
            key.push_str(pk3);
        }
        key
    }

    /// Prefix for scans: every edge of `kind`, optionally narrowed by pk1 then pk2
    pub fn prefix(kind: RelationKind, pk1: Option<&str>, pk2: Option<&str>) -> String {
        let mut prefix = format!("{}{}", kind.as_str(), EDGE_SEPARATOR);
        if let Some(pk1) = pk1 {
            prefix.push_str(pk1);
            prefix.push(EDGE_SEPARATOR);
            if let Some(pk2) = pk2 {
                prefix.push_str(pk2);
                prefix.push(EDGE_SEPARATOR);
            }
        }
        prefix
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub org: String,
    pub description: String,
}

impl Project {
    /// Human readable id, `{name}_{org}`
    pub fn id(&self) -> String {
        format!("{}_{}", self.name, self.org)
    }

    pub fn storage_key(org: &str, name: &str) -> String {
        format!("{org}{}{name}", KEY_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Lower-cased email
    pub id: String,
    pub name: String,
    pub org: String,
    pub role: Role,
}

/// Key of a user × project membership row
pub fn membership_key(user_id: &str, org: &str, project: &str) -> String {
    format!("{user_id}{sep}{org}{sep}{project}", sep = KEY_SEPARATOR)
}

/// Serialized copy of a deleted object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecycleBinEntry {
    pub org: String,
    pub project: String,
    pub object_id: String,
    /// Deletion time in millis followed by random digits
    pub stamp: String,
    pub object_json: String,
}

impl RecycleBinEntry {
    /// Human readable id, `{org}_{project}_{object}_{stamp}`
    pub fn id(&self) -> String {
        format!("{}_{}_{}_{}", self.org, self.project, self.object_id, self.stamp)
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}{}{}",
            Self::object_prefix(&self.org, &self.project, &self.object_id),
            KEY_SEPARATOR,
            self.stamp
        )
    }

    pub fn object_prefix(org: &str, project: &str, object_id: &str) -> String {
        format!("{org}{sep}{project}{sep}{object_id}", sep = KEY_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub org: String,
    pub project: String,
    /// Storage key of the resource the snapshot belongs to
    pub resource_id: String,
    pub name: String,
    pub extra_info: String,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn storage_key(org: &str, project: &str, resource_id: &str, name: &str) -> String {
        format!("{org}{sep}{project}{sep}{resource_id}{sep}{name}", sep = KEY_SEPARATOR)
    }

    pub fn key(&self) -> String {
        Self::storage_key(&self.org, &self.project, &self.resource_id, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scoped_id_normalizes() {
        let id = ScopedId::new(" Acme ", "Default", "Web Server").unwrap();
        assert_eq!(id.to_string(), "acme_default_web_server");
        assert_eq!(id.host_label(), "web_server_acme_default");
    }

    #[test]
    fn test_scoped_id_rejects_separator() {
        assert!(ScopedId::new("acme", "default", "bad\u{1f}name").is_err());
        assert!(ScopedId::new("acme", "", "web1").is_err());
    }

    #[test]
    fn test_underscores_do_not_collide() {
        let a = ScopedId::new("a_b", "c", "d").unwrap();
        let b = ScopedId::new("a", "b_c", "d").unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn test_role_ordering_and_parsing() {
        assert!(Role::User < Role::OrgAdmin);
        assert!(Role::OrgAdmin < Role::CloudAdmin);
        assert_eq!(Role::parse_lenient("CloudAdmin"), Role::CloudAdmin);
        assert_eq!(Role::parse_lenient("superuser"), Role::User);
    }

    #[test]
    fn test_host_resource_image_kind() {
        let mut resource = HostResource {
            name: "ubuntu".to_string(),
            uri: "https://images/ubuntu.qcow2".to_string(),
            architecture: "amd64".to_string(),
            description: String::new(),
            extra_info: "ubuntu22.04:qcow2".to_string(),
            resource_type: "image".to_string(),
        };
        assert_eq!(resource.os_type(), Some("ubuntu22.04"));
        assert!(resource.is_cloud_image());

        resource.extra_info = "win11:ISO".to_string();
        assert!(!resource.is_cloud_image());

        resource.extra_info = String::new();
        assert_eq!(resource.os_type(), None);
    }

    #[test]
    fn test_ruleset_reverses_rules() {
        let id = ScopedId::new("acme", "default", "web").unwrap();
        let ruleset = FirewallRuleset::new(id.clone(), "", r#"[{"a":1},{"b":2}]"#).unwrap();
        assert_eq!(ruleset.reversed_rules_json().unwrap(), r#"[{"b":2},{"a":1}]"#);

        assert!(FirewallRuleset::new(id, "", r#"{"a":1}"#).is_err());
    }

    #[test]
    fn test_relationship_prefixes_nest() {
        let edge = Relationship::new(RelationKind::VmVnetIp, "vm", "net").with_pk3("10.0.0.2");
        let key = edge.storage_key();
        assert!(key.starts_with(&Relationship::prefix(RelationKind::VmVnetIp, None, None)));
        assert!(key.starts_with(&Relationship::prefix(RelationKind::VmVnetIp, Some("vm"), None)));
        assert!(key.starts_with(&Relationship::prefix(
            RelationKind::VmVnetIp,
            Some("vm"),
            Some("net")
        )));
        assert!(!key.starts_with(&Relationship::prefix(RelationKind::VmVnetIp, Some("v"), None)));
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    proptest! {
        #[test]
        fn scoped_id_storage_key_round_trips(
            org in "[a-z0-9_-]{1,12}",
            project in "[a-z0-9_-]{1,12}",
            name in "[a-z0-9_.-]{1,16}",
        ) {
            let id = ScopedId::new(&org, &project, &name).unwrap();
            let decoded = ScopedId::from_storage_key(&id.storage_key()).unwrap();
            prop_assert_eq!(decoded, id);
        }
    }
}

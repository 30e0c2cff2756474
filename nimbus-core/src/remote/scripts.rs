//! Host-side scripts the control plane runs

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the shell scripts shipped to hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Script {
    CreateVm,
    DeleteVm,
    RenameVm,
    AddOrModifyVxlanBridge,
    DeleteVxlanBridge,
    AddVxlanPeers,
    DeleteVxlanPeers,
    AttachVmToVxlanBridge,
    DetachVmFromVxlanBridge,
    AssignIpToVxlanBridge,
    UnassignIpToVxlanBridge,
    AssignVmIpViaVxlan,
    UnassignVmIpViaVxlan,
    AssignVmIpViaVnet,
    UnassignVmIpViaVnet,
    GuestCheck,
    ApplyFirewallRulesetPublic,
    ApplyFirewallRulesetPrivate,
    RemoveFirewallRulesetPublic,
    RemoveFirewallRulesetPrivate,
}

impl Script {
    pub const ALL: [Script; 20] = [
        Script::CreateVm,
        Script::DeleteVm,
        Script::RenameVm,
        Script::AddOrModifyVxlanBridge,
        Script::DeleteVxlanBridge,
        Script::AddVxlanPeers,
        Script::DeleteVxlanPeers,
        Script::AttachVmToVxlanBridge,
        Script::DetachVmFromVxlanBridge,
        Script::AssignIpToVxlanBridge,
        Script::UnassignIpToVxlanBridge,
        Script::AssignVmIpViaVxlan,
        Script::UnassignVmIpViaVxlan,
        Script::AssignVmIpViaVnet,
        Script::UnassignVmIpViaVnet,
        Script::GuestCheck,
        Script::ApplyFirewallRulesetPublic,
        Script::ApplyFirewallRulesetPrivate,
        Script::RemoveFirewallRulesetPublic,
        Script::RemoveFirewallRulesetPrivate,
    ];

    /// Base name of the script, without extension
    pub fn name(&self) -> &'static str {
        match self {
            Script::CreateVm => "createVM",
            Script::DeleteVm => "deleteVM",
            Script::RenameVm => "renameVM",
            Script::AddOrModifyVxlanBridge => "addOrModifyVxLANBridge",
            Script::DeleteVxlanBridge => "deleteVxLANBridge",
            Script::AddVxlanPeers => "addVxLANPeers",
            Script::DeleteVxlanPeers => "deleteVxLANPeers",
            Script::AttachVmToVxlanBridge => "attachVMToVxLANBridge",
            Script::DetachVmFromVxlanBridge => "detachVMFromVxLANBridge",
            Script::AssignIpToVxlanBridge => "assignIPToVxLANBridge",
            Script::UnassignIpToVxlanBridge => "unassignIPToVxLANBridge",
            Script::AssignVmIpViaVxlan => "assignVMIPViaVxLAN",
            Script::UnassignVmIpViaVxlan => "unassignVMIPViaVxLAN",
            Script::AssignVmIpViaVnet => "assignVMIPViaVnet",
            Script::UnassignVmIpViaVnet => "unassignVMIPViaVnet",
            Script::GuestCheck => "guestCheck",
            Script::ApplyFirewallRulesetPublic => "applyFirewallRulesetPublic",
            Script::ApplyFirewallRulesetPrivate => "applyFirewallRulesetPrivate",
            Script::RemoveFirewallRulesetPublic => "removeFirewallRulesetPublic",
            Script::RemoveFirewallRulesetPrivate => "removeFirewallRulesetPrivate",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.sh", self.name())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test]
    fn test_file_names_are_unique() {
        let names: HashSet<_> = Script::ALL.iter().map(|s| s.file_name()).collect();
        assert_eq!(names.len(), Script::ALL.len());
        assert!(names.contains("addOrModifyVxLANBridge.sh"));
    }

    #[test_case(Script::CreateVm, "createVM.sh")]
    #[test_case(Script::DeleteVxlanPeers, "deleteVxLANPeers.sh")]
    #[test_case(Script::AssignVmIpViaVnet, "assignVMIPViaVnet.sh")]
    #[test_case(Script::GuestCheck, "guestCheck.sh")]
    fn test_display_is_file_name(script: Script, expected: &str) {
        assert_eq!(script.to_string(), expected);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Countable resources tracked by the quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Instances,
    Cores,
    Ram,
    FloatingIps,
    FixedIps,
    MetadataItems,
    InjectedFiles,
    InjectedFileContentBytes,
    InjectedFilePathBytes,
    SecurityGroups,
    SecurityGroupRules,
    KeyPairs,
    ServerGroups,
    ServerGroupMembers,
}

impl QuotaResource {
    pub const ALL: [QuotaResource; 14] = [
        QuotaResource::Instances,
        QuotaResource::Cores,
        QuotaResource::Ram,
        QuotaResource::FloatingIps,
        QuotaResource::FixedIps,
        QuotaResource::MetadataItems,
        QuotaResource::InjectedFiles,
        QuotaResource::InjectedFileContentBytes,
        QuotaResource::InjectedFilePathBytes,
        QuotaResource::SecurityGroups,
        QuotaResource::SecurityGroupRules,
        QuotaResource::KeyPairs,
        QuotaResource::ServerGroups,
        QuotaResource::ServerGroupMembers,
    ];

    /// Reservable resources have usage rows and go through reserve/commit.
    /// The rest are absolute limits checked with `limit_check`.
    pub fn is_reservable(&self) -> bool {
        matches!(
            self,
            QuotaResource::Instances
                | QuotaResource::Cores
                | QuotaResource::Ram
                | QuotaResource::FloatingIps
                | QuotaResource::FixedIps
                | QuotaResource::SecurityGroups
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaResource::Instances => "instances",
            QuotaResource::Cores => "cores",
            QuotaResource::Ram => "ram",
            QuotaResource::FloatingIps => "floating_ips",
            QuotaResource::FixedIps => "fixed_ips",
            QuotaResource::MetadataItems => "metadata_items",
            QuotaResource::InjectedFiles => "injected_files",
            QuotaResource::InjectedFileContentBytes => "injected_file_content_bytes",
            QuotaResource::InjectedFilePathBytes => "injected_file_path_bytes",
            QuotaResource::SecurityGroups => "security_groups",
            QuotaResource::SecurityGroupRules => "security_group_rules",
            QuotaResource::KeyPairs => "key_pairs",
            QuotaResource::ServerGroups => "server_groups",
            QuotaResource::ServerGroupMembers => "server_group_members",
        }
    }
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaResource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaResource::ALL.iter().copied().find(|r| r.as_str() == s).ok_or_else(|| Error::QuotaResourceUnknown(s.to_string()))
    }
}

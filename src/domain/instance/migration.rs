use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

use crate::domain::utils::id::{FlavorId, HostName, InstanceId};

new_key_type! {
    pub struct MigrationId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Queued,
    Accepted,
    Running,
    Finished,
    Confirming,
    Reverting,
    Confirmed,
    Reverted,
    Error,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Queued => "queued",
            MigrationStatus::Accepted => "accepted",
            MigrationStatus::Running => "running",
            MigrationStatus::Finished => "finished",
            MigrationStatus::Confirming => "confirming",
            MigrationStatus::Reverting => "reverting",
            MigrationStatus::Confirmed => "confirmed",
            MigrationStatus::Reverted => "reverted",
            MigrationStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Confirmed | MigrationStatus::Reverted | MigrationStatus::Error)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationType {
    Resize,
    Migration,
    LiveMigration,
    Evacuation,
}

/// Record of an in-flight resize, cold migration, live migration or evacuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub instance_uuid: InstanceId,
    pub source_compute: Option<HostName>,
    pub source_node: Option<String>,
    pub dest_compute: Option<HostName>,
    pub dest_node: Option<String>,
    pub old_instance_type_id: Option<FlavorId>,
    pub new_instance_type_id: Option<FlavorId>,
    pub status: MigrationStatus,
    pub migration_type: MigrationType,
    pub created_at: DateTime<Utc>,
}

impl Migration {
    pub fn new(instance_uuid: InstanceId, migration_type: MigrationType, status: MigrationStatus) -> Self {
        Self {
            instance_uuid,
            source_compute: None,
            source_node: None,
            dest_compute: None,
            dest_node: None,
            old_instance_type_id: None,
            new_instance_type_id: None,
            status,
            migration_type,
            created_at: Utc::now(),
        }
    }
}

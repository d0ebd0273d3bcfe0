use chrono::{DateTime, Utc};

use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::instance::instance::Instance;
use crate::domain::utils::id::{InstanceId, ProjectId};

/// Snapshot of an instance that has been admitted but not yet placed.
///
/// Exists only between admission and the scheduler's placement decision;
/// deleting it before placement cancels the build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub instance_uuid: InstanceId,
    pub project_id: ProjectId,
    pub instance: Instance,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub created_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(instance: Instance, block_device_mappings: Vec<BlockDeviceMapping>) -> Self {
        Self {
            instance_uuid: instance.uuid.clone(),
            project_id: instance.project_id.clone(),
            instance,
            block_device_mappings,
            created_at: Utc::now(),
        }
    }
}

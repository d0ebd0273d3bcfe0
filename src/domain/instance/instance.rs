use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::instance::flavor::Flavor;
use crate::domain::instance::resources::{NumaTopology, PciRequest};
use crate::domain::instance::vm_state::{TaskState, VmState};
use crate::domain::utils::id::{HostName, ImageId, InstanceId, ProjectId, UserId};

/// Who placed the lock on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedBy {
    Owner,
    Admin,
}

/// Durable record of a managed virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: InstanceId,
    pub display_name: String,
    pub display_description: Option<String>,
    pub hostname: String,

    pub vm_state: VmState,
    pub task_state: Option<TaskState>,
    pub progress: u8,

    pub host: Option<HostName>,
    pub node: Option<String>,
    pub availability_zone: Option<String>,

    pub flavor: Flavor,
    pub old_flavor: Option<Flavor>,
    pub new_flavor: Option<Flavor>,

    pub image_ref: Option<ImageId>,
    pub kernel_id: Option<ImageId>,
    pub ramdisk_id: Option<ImageId>,
    pub root_device_name: Option<String>,

    pub metadata: BTreeMap<String, String>,
    pub system_metadata: BTreeMap<String, String>,

    pub project_id: ProjectId,
    pub user_id: UserId,

    pub locked: bool,
    pub locked_by: Option<LockedBy>,
    pub disable_terminate: bool,
    pub shutdown_terminate: bool,

    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,

    pub reservation_id: String,
    pub launch_index: u32,

    pub key_name: Option<String>,
    pub key_data: Option<String>,
    pub user_data: Option<String>,
    pub config_drive: bool,
    pub auto_disk_config: bool,
    pub access_ip_v4: Option<String>,
    pub access_ip_v6: Option<String>,
    pub os_type: Option<String>,
    pub architecture: Option<String>,
    pub vm_mode: Option<String>,
    pub security_groups: Vec<String>,

    pub numa_topology: Option<NumaTopology>,
    pub pci_requests: Vec<PciRequest>,
}

impl Instance {
    /// A blank record in `BUILDING` owned by the given project/user.
    pub fn new(uuid: InstanceId, project_id: ProjectId, user_id: UserId, flavor: Flavor) -> Self {
        Self {
            display_name: String::new(),
            display_description: None,
            hostname: String::new(),
            uuid,
            vm_state: VmState::Building,
            task_state: None,
            progress: 0,
            host: None,
            node: None,
            availability_zone: None,
            flavor,
            old_flavor: None,
            new_flavor: None,
            image_ref: None,
            kernel_id: None,
            ramdisk_id: None,
            root_device_name: None,
            metadata: BTreeMap::new(),
            system_metadata: BTreeMap::new(),
            project_id,
            user_id,
            locked: false,
            locked_by: None,
            disable_terminate: false,
            shutdown_terminate: true,
            created_at: Utc::now(),
            launched_at: None,
            terminated_at: None,
            deleted_at: None,
            reservation_id: String::new(),
            launch_index: 0,
            key_name: None,
            key_data: None,
            user_data: None,
            config_drive: false,
            auto_disk_config: false,
            access_ip_v4: None,
            access_ip_v6: None,
            os_type: None,
            architecture: None,
            vm_mode: None,
            security_groups: Vec::new(),
            numa_topology: None,
            pci_requests: Vec::new(),
        }
    }

    pub fn has_launched(&self) -> bool {
        self.launched_at.is_some()
    }
}

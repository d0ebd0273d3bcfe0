use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::migration::MigrationId;
use crate::domain::utils::id::{AttachmentId, HostName, ImageId, InstanceId, NetworkId, PortId, VolumeId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootType {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteType {
    Delete,
    SoftDelete,
    ForceDelete,
}

impl DeleteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteType::Delete => "delete",
            DeleteType::SoftDelete => "soft_delete",
            DeleteType::ForceDelete => "force_delete",
        }
    }
}

/// One side of a metadata diff sent to the host worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataChange {
    Set(String),
    Delete,
}

/// Work order for the per-host worker. One verb per lifecycle operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HostWorkOrder {
    TerminateInstance { bdms: Vec<BlockDeviceMapping> },
    SoftDeleteInstance,
    RestoreInstance,
    StopInstance { clean_shutdown: bool },
    StartInstance,
    RebootInstance { reboot_type: RebootType },
    PauseInstance,
    UnpauseInstance,
    SuspendInstance,
    ResumeInstance,
    RescueInstance { rescue_password: Option<String>, rescue_image_ref: Option<ImageId>, clean_shutdown: bool },
    UnrescueInstance,
    ShelveInstance { image_id: ImageId, clean_shutdown: bool },
    ShelveOffloadInstance { clean_shutdown: bool },
    ConfirmResize { migration_id: MigrationId },
    RevertResize { migration_id: MigrationId },
    AttachVolume { bdm: BlockDeviceMapping },
    DetachVolume { volume_id: VolumeId, attachment_id: Option<AttachmentId> },
    SwapVolume { old_volume_id: VolumeId, new_volume_id: VolumeId },
    AttachInterface { network_id: Option<NetworkId>, port_id: Option<PortId>, requested_ip: Option<String> },
    DetachInterface { port_id: PortId },
    ChangeInstanceMetadata { diff: BTreeMap<String, MetadataChange> },
    SetAdminPassword { new_pass: String },
    SnapshotInstance { image_id: ImageId },
    BackupInstance { image_id: ImageId, backup_type: String, rotation: u32 },
    TriggerCrashDump,
    LiveMigrationForceComplete { migration_id: MigrationId },
    LiveMigrationAbort { migration_id: MigrationId },
}

impl HostWorkOrder {
    pub fn verb(&self) -> &'static str {
        match self {
            HostWorkOrder::TerminateInstance { .. } => "terminate_instance",
            HostWorkOrder::SoftDeleteInstance => "soft_delete_instance",
            HostWorkOrder::RestoreInstance => "restore_instance",
            HostWorkOrder::StopInstance { .. } => "stop_instance",
            HostWorkOrder::StartInstance => "start_instance",
            HostWorkOrder::RebootInstance { .. } => "reboot_instance",
            HostWorkOrder::PauseInstance => "pause_instance",
            HostWorkOrder::UnpauseInstance => "unpause_instance",
            HostWorkOrder::SuspendInstance => "suspend_instance",
            HostWorkOrder::ResumeInstance => "resume_instance",
            HostWorkOrder::RescueInstance { .. } => "rescue_instance",
            HostWorkOrder::UnrescueInstance => "unrescue_instance",
            HostWorkOrder::ShelveInstance { .. } => "shelve_instance",
            HostWorkOrder::ShelveOffloadInstance { .. } => "shelve_offload_instance",
            HostWorkOrder::ConfirmResize { .. } => "confirm_resize",
            HostWorkOrder::RevertResize { .. } => "revert_resize",
            HostWorkOrder::AttachVolume { .. } => "attach_volume",
            HostWorkOrder::DetachVolume { .. } => "detach_volume",
            HostWorkOrder::SwapVolume { .. } => "swap_volume",
            HostWorkOrder::AttachInterface { .. } => "attach_interface",
            HostWorkOrder::DetachInterface { .. } => "detach_interface",
            HostWorkOrder::ChangeInstanceMetadata { .. } => "change_instance_metadata",
            HostWorkOrder::SetAdminPassword { .. } => "set_admin_password",
            HostWorkOrder::SnapshotInstance { .. } => "snapshot_instance",
            HostWorkOrder::BackupInstance { .. } => "backup_instance",
            HostWorkOrder::TriggerCrashDump => "trigger_crash_dump",
            HostWorkOrder::LiveMigrationForceComplete { .. } => "live_migration_force_complete",
            HostWorkOrder::LiveMigrationAbort { .. } => "live_migration_abort",
        }
    }
}

/// Dispatch channel to the worker running on a compute host.
///
/// `cast` returns once the order is handed off; the hypervisor-level action
/// completes asynchronously.
pub trait ComputeRpc: Debug + Send + Sync {
    fn cast(&self, ctx: &RequestContext, host: &HostName, instance: &Instance, order: HostWorkOrder) -> Result<()>;

    /// Asks the host to pick (or confirm) a device name for a new volume.
    fn reserve_block_device_name(
        &self,
        ctx: &RequestContext,
        host: &HostName,
        instance: &Instance,
        device: Option<&str>,
        volume_id: &VolumeId,
    ) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedOrder {
    pub host: HostName,
    pub instance_uuid: InstanceId,
    pub order: HostWorkOrder,
}

/// Records every dispatched order instead of sending it anywhere.
#[derive(Debug, Clone, Default)]
pub struct InMemoryComputeRpc {
    orders: Arc<RwLock<Vec<DispatchedOrder>>>,
}

impl InMemoryComputeRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orders(&self) -> Vec<DispatchedOrder> {
        self.orders.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn verbs_for(&self, instance_uuid: &InstanceId) -> Vec<&'static str> {
        self.orders().iter().filter(|o| &o.instance_uuid == instance_uuid).map(|o| o.order.verb()).collect()
    }
}

impl ComputeRpc for InMemoryComputeRpc {
    fn cast(&self, _ctx: &RequestContext, host: &HostName, instance: &Instance, order: HostWorkOrder) -> Result<()> {
        log::debug!("ComputeRpc: {} -> {} for instance {}", order.verb(), host, instance.uuid);
        self.orders.write().unwrap_or_else(PoisonError::into_inner).push(DispatchedOrder {
            host: host.clone(),
            instance_uuid: instance.uuid.clone(),
            order,
        });
        Ok(())
    }

    fn reserve_block_device_name(
        &self,
        _ctx: &RequestContext,
        _host: &HostName,
        _instance: &Instance,
        device: Option<&str>,
        _volume_id: &VolumeId,
    ) -> Result<String> {
        Ok(device.map(str::to_string).unwrap_or_else(|| "/dev/vdb".to_string()))
    }
}

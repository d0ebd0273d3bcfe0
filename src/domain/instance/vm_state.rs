use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable, user-visible lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Record exists, placement or spawn still in progress.
    Building,
    /// Running.
    Active,
    /// Powered off, resources still held on the host.
    Stopped,
    Paused,
    Suspended,
    /// Booted from a rescue image.
    Rescued,
    /// Resize or migration finished, waiting for confirm or revert.
    Resized,
    /// Shelved with the disk still on the host.
    Shelved,
    /// Shelved and removed from its host.
    ShelvedOffloaded,
    /// Deleted but still restorable.
    SoftDeleted,
    Deleted,
    Error,
}

impl VmState {
    pub const ALLOW_SOFT_REBOOT: &'static [VmState] = &[VmState::Active];
    pub const ALLOW_HARD_REBOOT: &'static [VmState] =
        &[VmState::Active, VmState::Stopped, VmState::Paused, VmState::Suspended, VmState::Error];
    pub const ALLOW_TRIGGER_CRASH_DUMP: &'static [VmState] =
        &[VmState::Active, VmState::Paused, VmState::Rescued, VmState::Resized, VmState::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Building => "building",
            VmState::Active => "active",
            VmState::Stopped => "stopped",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Rescued => "rescued",
            VmState::Resized => "resized",
            VmState::Shelved => "shelved",
            VmState::ShelvedOffloaded => "shelved_offloaded",
            VmState::SoftDeleted => "soft-delete",
            VmState::Deleted => "deleted",
            VmState::Error => "error",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient marker for an operation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduling,
    BlockDeviceMapping,
    Networking,
    Spawning,
    ImageSnapshot,
    ImageSnapshotPending,
    ImageBackup,
    UpdatingPassword,
    ResizePrep,
    ResizeMigrating,
    ResizeMigrated,
    ResizeFinish,
    ResizeReverting,
    ResizeConfirming,
    Rebooting,
    RebootPending,
    RebootStarted,
    RebootingHard,
    RebootPendingHard,
    RebootStartedHard,
    Pausing,
    Unpausing,
    Suspending,
    Resuming,
    PoweringOff,
    PoweringOn,
    Rescuing,
    Unrescuing,
    Rebuilding,
    Migrating,
    Deleting,
    SoftDeleting,
    Restoring,
    Shelving,
    ShelvingOffloading,
    Unshelving,
}

impl TaskState {
    /// Task states a hard reboot may interrupt.
    pub const ALLOW_REBOOT: &'static [Option<TaskState>] = &[
        None,
        Some(TaskState::Rebooting),
        Some(TaskState::RebootPending),
        Some(TaskState::RebootStarted),
        Some(TaskState::RebootingHard),
        Some(TaskState::Resuming),
        Some(TaskState::Unpausing),
        Some(TaskState::Pausing),
        Some(TaskState::Suspending),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduling => "scheduling",
            TaskState::BlockDeviceMapping => "block_device_mapping",
            TaskState::Networking => "networking",
            TaskState::Spawning => "spawning",
            TaskState::ImageSnapshot => "image_snapshot",
            TaskState::ImageSnapshotPending => "image_snapshot_pending",
            TaskState::ImageBackup => "image_backup",
            TaskState::UpdatingPassword => "updating_password",
            TaskState::ResizePrep => "resize_prep",
            TaskState::ResizeMigrating => "resize_migrating",
            TaskState::ResizeMigrated => "resize_migrated",
            TaskState::ResizeFinish => "resize_finish",
            TaskState::ResizeReverting => "resize_reverting",
            TaskState::ResizeConfirming => "resize_confirming",
            TaskState::Rebooting => "rebooting",
            TaskState::RebootPending => "reboot_pending",
            TaskState::RebootStarted => "reboot_started",
            TaskState::RebootingHard => "rebooting_hard",
            TaskState::RebootPendingHard => "reboot_pending_hard",
            TaskState::RebootStartedHard => "reboot_started_hard",
            TaskState::Pausing => "pausing",
            TaskState::Unpausing => "unpausing",
            TaskState::Suspending => "suspending",
            TaskState::Resuming => "resuming",
            TaskState::PoweringOff => "powering-off",
            TaskState::PoweringOn => "powering-on",
            TaskState::Rescuing => "rescuing",
            TaskState::Unrescuing => "unrescuing",
            TaskState::Rebuilding => "rebuilding",
            TaskState::Migrating => "migrating",
            TaskState::Deleting => "deleting",
            TaskState::SoftDeleting => "soft-deleting",
            TaskState::Restoring => "restoring",
            TaskState::Shelving => "shelving",
            TaskState::ShelvingOffloading => "shelving_offloading",
            TaskState::Unshelving => "unshelving",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders an optional task state the way error messages expect.
pub fn task_state_str(task_state: Option<TaskState>) -> &'static str {
    task_state.map(|t| t.as_str()).unwrap_or("None")
}

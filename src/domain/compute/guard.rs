use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::{TaskState, VmState, task_state_str};
use crate::domain::utils::id::HostName;
use crate::error::{Error, Result};

/// Task states an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStateRequirement {
    Any,
    /// No operation may be in progress.
    NoneOnly,
    OneOf(&'static [Option<TaskState>]),
}

impl TaskStateRequirement {
    fn allows(&self, task_state: Option<TaskState>) -> bool {
        match self {
            TaskStateRequirement::Any => true,
            TaskStateRequirement::NoneOnly => task_state.is_none(),
            TaskStateRequirement::OneOf(allowed) => allowed.contains(&task_state),
        }
    }
}

/// Preconditions of one lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateGuard {
    pub method: &'static str,
    /// `None` accepts any vm state.
    pub vm_state: Option<&'static [VmState]>,
    pub task_state: TaskStateRequirement,
    pub must_have_launched: bool,
}

impl StateGuard {
    pub const fn new(method: &'static str, vm_state: &'static [VmState]) -> Self {
        Self { method, vm_state: Some(vm_state), task_state: TaskStateRequirement::NoneOnly, must_have_launched: true }
    }

    pub const fn any_vm_state(method: &'static str) -> Self {
        Self { method, vm_state: None, task_state: TaskStateRequirement::NoneOnly, must_have_launched: true }
    }

    pub const fn task_state(mut self, task_state: TaskStateRequirement) -> Self {
        self.task_state = task_state;
        self
    }

    pub const fn launch_not_required(mut self) -> Self {
        self.must_have_launched = false;
        self
    }

    /// Rejects the instance unless it satisfies every precondition.
    ///
    /// # Errors
    /// `InvalidState` naming the violated attribute, its value and the method.
    pub fn check(&self, instance: &Instance) -> Result<()> {
        if let Some(allowed) = self.vm_state {
            if !allowed.contains(&instance.vm_state) {
                return Err(self.invalid(instance, "vm_state", instance.vm_state.as_str()));
            }
        }

        if !self.task_state.allows(instance.task_state) {
            return Err(self.invalid(instance, "task_state", task_state_str(instance.task_state)));
        }

        if self.must_have_launched && !instance.has_launched() {
            return Err(self.invalid(instance, "launched_at", "None"));
        }
        Ok(())
    }

    fn invalid(&self, instance: &Instance, attr: &'static str, state: &str) -> Error {
        log::debug!("Guard: {} rejected for instance {}: {} is {}", self.method, instance.uuid, attr, state);
        Error::InvalidState { instance_id: instance.uuid.clone(), attr, state: state.to_string(), method: self.method }
    }
}

//---------------------
// --- Guards per operation ---

const ACTIVE_STOPPED_ERROR: &[VmState] = &[VmState::Active, VmState::Stopped, VmState::Error];
const ACTIVE_STOPPED: &[VmState] = &[VmState::Active, VmState::Stopped];
const SHELVABLE: &[VmState] = &[VmState::Active, VmState::Stopped, VmState::Paused, VmState::Suspended];
const SNAPSHOTTABLE: &[VmState] = &[VmState::Active, VmState::Stopped, VmState::Paused, VmState::Suspended];
const VOLUME_SNAPSHOTTABLE: &[VmState] = &[VmState::Active, VmState::Stopped, VmState::Suspended];
const VOLUME_ATTACHABLE: &[VmState] = &[
    VmState::Active,
    VmState::Paused,
    VmState::Stopped,
    VmState::Resized,
    VmState::SoftDeleted,
    VmState::Shelved,
    VmState::ShelvedOffloaded,
];
const INTERFACE_ATTACHABLE: &[VmState] = &[VmState::Active, VmState::Paused, VmState::Stopped];
const METADATA_EDITABLE: &[VmState] = &[VmState::Active, VmState::Paused, VmState::Suspended, VmState::Stopped];
const VOLUME_SWAPPABLE: &[VmState] = &[
    VmState::Active,
    VmState::Paused,
    VmState::Suspended,
    VmState::Stopped,
    VmState::Resized,
    VmState::SoftDeleted,
];

pub const STOP: StateGuard = StateGuard::new("stop", &[VmState::Active, VmState::Error]);
pub const START: StateGuard = StateGuard::new("start", &[VmState::Stopped]);
pub const SOFT_REBOOT: StateGuard = StateGuard::new("reboot", VmState::ALLOW_SOFT_REBOOT);
pub const HARD_REBOOT: StateGuard =
    StateGuard::new("reboot", VmState::ALLOW_HARD_REBOOT).task_state(TaskStateRequirement::OneOf(TaskState::ALLOW_REBOOT));
pub const REBUILD: StateGuard = StateGuard::new("rebuild", ACTIVE_STOPPED_ERROR);
pub const RESIZE: StateGuard = StateGuard::new("resize", ACTIVE_STOPPED);
pub const CONFIRM_RESIZE: StateGuard = StateGuard::new("confirm_resize", &[VmState::Resized]);
pub const REVERT_RESIZE: StateGuard = StateGuard::new("revert_resize", &[VmState::Resized]);
pub const SHELVE: StateGuard = StateGuard::new("shelve", SHELVABLE);
pub const SHELVE_OFFLOAD: StateGuard = StateGuard::new("shelve_offload", &[VmState::Shelved]);
pub const UNSHELVE: StateGuard = StateGuard::new("unshelve", &[VmState::Shelved, VmState::ShelvedOffloaded]);
pub const RESCUE: StateGuard = StateGuard::new("rescue", ACTIVE_STOPPED_ERROR);
pub const UNRESCUE: StateGuard = StateGuard::new("unrescue", &[VmState::Rescued]);
pub const PAUSE: StateGuard = StateGuard::new("pause", &[VmState::Active]);
pub const UNPAUSE: StateGuard = StateGuard::new("unpause", &[VmState::Paused]);
pub const SUSPEND: StateGuard = StateGuard::new("suspend", &[VmState::Active]);
pub const RESUME: StateGuard = StateGuard::new("resume", &[VmState::Suspended]);
pub const SET_ADMIN_PASSWORD: StateGuard = StateGuard::new("set_admin_password", &[VmState::Active]);
pub const SNAPSHOT: StateGuard = StateGuard::new("snapshot", SNAPSHOTTABLE);
pub const BACKUP: StateGuard = StateGuard::new("backup", SNAPSHOTTABLE);
pub const SNAPSHOT_VOLUME_BACKED: StateGuard = StateGuard::new("snapshot_volume_backed", VOLUME_SNAPSHOTTABLE);
pub const TRIGGER_CRASH_DUMP: StateGuard = StateGuard::new("trigger_crash_dump", VmState::ALLOW_TRIGGER_CRASH_DUMP);
pub const LIVE_MIGRATE: StateGuard = StateGuard::new("live_migrate", &[VmState::Active, VmState::Paused]);
pub const LIVE_MIGRATE_FORCE_COMPLETE: StateGuard = StateGuard::new("live_migrate_force_complete", &[VmState::Active])
    .task_state(TaskStateRequirement::OneOf(&[Some(TaskState::Migrating)]));
pub const LIVE_MIGRATE_ABORT: StateGuard = StateGuard::any_vm_state("live_migrate_abort")
    .task_state(TaskStateRequirement::OneOf(&[Some(TaskState::Migrating)]));
pub const EVACUATE: StateGuard = StateGuard::new("evacuate", ACTIVE_STOPPED_ERROR);
pub const SOFT_DELETE: StateGuard = StateGuard::any_vm_state("soft_delete").task_state(TaskStateRequirement::Any);
pub const DELETE: StateGuard = StateGuard::any_vm_state("delete").task_state(TaskStateRequirement::Any).launch_not_required();
pub const FORCE_DELETE: StateGuard = StateGuard::any_vm_state("force_delete").launch_not_required();
pub const RESTORE: StateGuard = StateGuard::new("restore", &[VmState::SoftDeleted]);
pub const ATTACH_VOLUME: StateGuard = StateGuard::new("attach_volume", VOLUME_ATTACHABLE);
pub const DETACH_VOLUME: StateGuard = StateGuard::new("detach_volume", VOLUME_ATTACHABLE);
pub const SWAP_VOLUME: StateGuard = StateGuard::new("swap_volume", VOLUME_SWAPPABLE);
pub const ATTACH_INTERFACE: StateGuard = StateGuard::new("attach_interface", INTERFACE_ATTACHABLE);
pub const DETACH_INTERFACE: StateGuard = StateGuard::new("detach_interface", INTERFACE_ATTACHABLE);
pub const UPDATE_METADATA: StateGuard =
    StateGuard::new("update_instance_metadata", METADATA_EDITABLE).task_state(TaskStateRequirement::Any);
pub const DELETE_METADATA: StateGuard =
    StateGuard::new("delete_instance_metadata", METADATA_EDITABLE).task_state(TaskStateRequirement::Any);

/// Non-admin callers may not act on a locked instance.
pub fn check_instance_lock(ctx: &RequestContext, instance: &Instance) -> Result<()> {
    if instance.locked && !ctx.is_admin {
        return Err(Error::InstanceLocked(instance.uuid.clone()));
    }
    Ok(())
}

/// Host the instance runs on, for operations that talk to its worker.
pub fn check_instance_host(instance: &Instance) -> Result<&HostName> {
    instance.host.as_ref().ok_or_else(|| Error::InstanceNotReady(instance.uuid.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::flavor::Flavor;
    use crate::domain::utils::id::{InstanceId, ProjectId, UserId};
    use chrono::Utc;

    fn instance(vm_state: VmState, task_state: Option<TaskState>) -> Instance {
        let mut instance =
            Instance::new(InstanceId::generate(), ProjectId::new("p1"), UserId::new("u1"), Flavor::new("f", 1, 512, 1));
        instance.vm_state = vm_state;
        instance.task_state = task_state;
        instance.launched_at = Some(Utc::now());
        instance
    }

    #[test]
    fn vm_state_violation_names_the_attribute() {
        let err = STOP.check(&instance(VmState::Building, None)).unwrap_err();
        match err {
            Error::InvalidState { attr, state, method, .. } => {
                assert_eq!((attr, state.as_str(), method), ("vm_state", "building", "stop"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn hard_reboot_tolerates_soft_reboot_in_progress() {
        let rebooting = instance(VmState::Active, Some(TaskState::Rebooting));
        assert!(HARD_REBOOT.check(&rebooting).is_ok());
        assert!(matches!(SOFT_REBOOT.check(&rebooting), Err(Error::InvalidState { attr: "task_state", .. })));
    }

    #[test]
    fn unlaunched_instance_is_rejected() {
        let mut fresh = instance(VmState::Stopped, None);
        fresh.launched_at = None;
        assert!(matches!(START.check(&fresh), Err(Error::InvalidState { attr: "launched_at", .. })));
        assert!(DELETE.check(&fresh).is_ok());
    }

    #[test]
    fn admins_bypass_the_lock() {
        let mut locked = instance(VmState::Active, None);
        locked.locked = true;
        assert!(matches!(check_instance_lock(&RequestContext::new("p1", "u1"), &locked), Err(Error::InstanceLocked(_))));
        assert!(check_instance_lock(&RequestContext::admin("p1", "admin"), &locked).is_ok());
    }
}

use chrono::Utc;

use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::{TaskState, VmState, task_state_str};

/// `tracing` target of every lifecycle notification.
pub const LIFECYCLE_TARGET: &str = "instance_lifecycle";

/// User-visible actions recorded against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Create,
    Delete,
    Restore,
    Stop,
    Start,
    Reboot,
    Rebuild,
    Resize,
    Migrate,
    ConfirmResize,
    RevertResize,
    Pause,
    Unpause,
    Suspend,
    Resume,
    Rescue,
    Unrescue,
    Shelve,
    ShelveOffload,
    Unshelve,
    ChangePassword,
    Lock,
    Unlock,
    AttachVolume,
    DetachVolume,
    SwapVolume,
    AttachInterface,
    DetachInterface,
    LiveMigration,
    LiveMigrationForceComplete,
    LiveMigrationAbort,
    Evacuate,
    TriggerCrashDump,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Create => "create",
            InstanceAction::Delete => "delete",
            InstanceAction::Restore => "restore",
            InstanceAction::Stop => "stop",
            InstanceAction::Start => "start",
            InstanceAction::Reboot => "reboot",
            InstanceAction::Rebuild => "rebuild",
            InstanceAction::Resize => "resize",
            InstanceAction::Migrate => "migrate",
            InstanceAction::ConfirmResize => "confirmResize",
            InstanceAction::RevertResize => "revertResize",
            InstanceAction::Pause => "pause",
            InstanceAction::Unpause => "unpause",
            InstanceAction::Suspend => "suspend",
            InstanceAction::Resume => "resume",
            InstanceAction::Rescue => "rescue",
            InstanceAction::Unrescue => "unrescue",
            InstanceAction::Shelve => "shelve",
            InstanceAction::ShelveOffload => "shelveOffload",
            InstanceAction::Unshelve => "unshelve",
            InstanceAction::ChangePassword => "changePassword",
            InstanceAction::Lock => "lock",
            InstanceAction::Unlock => "unlock",
            InstanceAction::AttachVolume => "attach_volume",
            InstanceAction::DetachVolume => "detach_volume",
            InstanceAction::SwapVolume => "swap_volume",
            InstanceAction::AttachInterface => "attach_interface",
            InstanceAction::DetachInterface => "detach_interface",
            InstanceAction::LiveMigration => "live-migration",
            InstanceAction::LiveMigrationForceComplete => "live_migration_force_complete",
            InstanceAction::LiveMigrationAbort => "live_migration_abort",
            InstanceAction::Evacuate => "evacuate",
            InstanceAction::TriggerCrashDump => "trigger_crash_dump",
        }
    }
}

/// Records the start of a user-visible action.
pub fn record_action_start(ctx: &RequestContext, instance: &Instance, action: InstanceAction) {
    tracing::info!(
        target: LIFECYCLE_TARGET,
        Time = %Utc::now(),
        Event = "instance.action.start",
        InstanceId = %instance.uuid,
        Action = action.as_str(),
        RequestId = %ctx.request_id,
        ProjectId = %ctx.project_id,
        UserId = %ctx.user_id,
    );
}

/// Announces a state transition that was persisted locally.
pub fn send_update_with_states(
    ctx: &RequestContext,
    instance: &Instance,
    old_vm_state: VmState,
    new_vm_state: VmState,
    old_task_state: Option<TaskState>,
    new_task_state: Option<TaskState>,
) {
    tracing::info!(
        target: LIFECYCLE_TARGET,
        Time = %Utc::now(),
        Event = "compute.instance.update",
        InstanceId = %instance.uuid,
        RequestId = %ctx.request_id,
        OldVmState = old_vm_state.as_str(),
        NewVmState = new_vm_state.as_str(),
        OldTaskState = task_state_str(old_task_state),
        NewTaskState = task_state_str(new_task_state),
    );
}

/// A freshly created record, announced once per instance.
pub fn send_update(ctx: &RequestContext, instance: &Instance) {
    send_update_with_states(ctx, instance, instance.vm_state, instance.vm_state, instance.task_state, instance.task_state);
}

/// Usage event such as `delete.start` or `delete.end`.
pub fn notify_about_instance_usage(ctx: &RequestContext, instance: &Instance, event_suffix: &str) {
    tracing::info!(
        target: LIFECYCLE_TARGET,
        Time = %Utc::now(),
        Event = %format!("compute.instance.{}", event_suffix),
        InstanceId = %instance.uuid,
        RequestId = %ctx.request_id,
        Host = instance.host.as_ref().map(|h| h.as_str()).unwrap_or("None"),
        Flavor = %instance.flavor.flavorid,
        VmState = instance.vm_state.as_str(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::flavor::Flavor;
    use crate::domain::utils::id::{InstanceId, ProjectId, UserId};
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn usage_events_carry_the_event_name() {
        let instance = Instance::new(InstanceId::new("i-1"), ProjectId::new("p1"), UserId::new("u1"), Flavor::new("f", 1, 512, 1));
        notify_about_instance_usage(&RequestContext::new("p1", "u1"), &instance, "delete.start");

        assert!(logs_contain("compute.instance.delete.start"));
        assert!(logs_contain("i-1"));
    }
}

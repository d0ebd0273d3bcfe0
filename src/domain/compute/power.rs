use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::guard::{self, StateGuard, check_instance_host, check_instance_lock};
use crate::domain::compute::notifications::{InstanceAction, record_action_start};
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::TaskState;
use crate::domain::services::compute_rpc::{HostWorkOrder, RebootType};
use crate::domain::utils::id::InstanceId;
use crate::error::Result;

impl ComputeApi {
    pub fn stop(&self, ctx: &RequestContext, instance_uuid: &InstanceId, clean_shutdown: bool) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::STOP.check(&instance)?;

        instance.progress = 0;
        self.set_task_state(ctx, &mut instance, Some(TaskState::PoweringOff), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Stop);
        self.cast_to_host(ctx, &instance, HostWorkOrder::StopInstance { clean_shutdown })?;
        Ok(instance)
    }

    pub fn start(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        self.simple_power_transition(
            ctx,
            instance_uuid,
            &guard::START,
            TaskState::PoweringOn,
            InstanceAction::Start,
            HostWorkOrder::StartInstance,
        )
    }

    /// Soft reboots need an idle instance; hard reboots may interrupt a
    /// soft reboot or a pending power transition.
    pub fn reboot(&self, ctx: &RequestContext, instance_uuid: &InstanceId, reboot_type: RebootType) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;

        let (state_guard, task_state, expected): (&StateGuard, TaskState, &[Option<TaskState>]) = match reboot_type {
            RebootType::Soft => (&guard::SOFT_REBOOT, TaskState::Rebooting, &[None]),
            RebootType::Hard => (&guard::HARD_REBOOT, TaskState::RebootingHard, TaskState::ALLOW_REBOOT),
        };
        state_guard.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(task_state), expected)?;
        record_action_start(ctx, &instance, InstanceAction::Reboot);
        self.cast_to_host(ctx, &instance, HostWorkOrder::RebootInstance { reboot_type })?;
        Ok(instance)
    }

    pub fn pause(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        self.simple_power_transition(
            ctx,
            instance_uuid,
            &guard::PAUSE,
            TaskState::Pausing,
            InstanceAction::Pause,
            HostWorkOrder::PauseInstance,
        )
    }

    pub fn unpause(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        self.simple_power_transition(
            ctx,
            instance_uuid,
            &guard::UNPAUSE,
            TaskState::Unpausing,
            InstanceAction::Unpause,
            HostWorkOrder::UnpauseInstance,
        )
    }

    pub fn suspend(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        self.simple_power_transition(
            ctx,
            instance_uuid,
            &guard::SUSPEND,
            TaskState::Suspending,
            InstanceAction::Suspend,
            HostWorkOrder::SuspendInstance,
        )
    }

    pub fn resume(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        self.simple_power_transition(
            ctx,
            instance_uuid,
            &guard::RESUME,
            TaskState::Resuming,
            InstanceAction::Resume,
            HostWorkOrder::ResumeInstance,
        )
    }

    /// No task state is recorded; the host reports the dump asynchronously.
    pub fn trigger_crash_dump(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::TRIGGER_CRASH_DUMP.check(&instance)?;
        check_instance_host(&instance)?;

        log::debug!("ComputeApi {}: try to trigger crash dump", instance.uuid);
        record_action_start(ctx, &instance, InstanceAction::TriggerCrashDump);
        self.cast_to_host(ctx, &instance, HostWorkOrder::TriggerCrashDump)
    }

    fn simple_power_transition(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        state_guard: &StateGuard,
        task_state: TaskState,
        action: InstanceAction,
        order: HostWorkOrder,
    ) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        state_guard.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(task_state), &[None])?;
        record_action_start(ctx, &instance, action);
        self.cast_to_host(ctx, &instance, order)?;
        Ok(instance)
    }
}

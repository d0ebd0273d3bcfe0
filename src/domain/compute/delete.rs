use chrono::Utc;

use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::guard::{self, check_instance_lock};
use crate::domain::compute::notifications::{InstanceAction, notify_about_instance_usage, record_action_start};
use crate::domain::config::CellType;
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::migration::MigrationStatus;
use crate::domain::instance::vm_state::{TaskState, VmState};
use crate::domain::quota::deltas::{downsize, instance_deltas};
use crate::domain::quota::reservation::QuotaReservation;
use crate::domain::services::compute_rpc::{DeleteType, HostWorkOrder};
use crate::domain::utils::id::{ImageId, InstanceId};
use crate::error::Result;

/// System metadata key of the snapshot taken when an instance was shelved.
pub const SHELVED_IMAGE_ID: &str = "shelved_image_id";

/// What to do with the decrement reservation once a delete path finished.
enum QuotaOutcome {
    Commit,
    Rollback,
}

impl ComputeApi {
    /// Terminates an instance in any state.
    ///
    /// An instance still waiting for placement is cancelled by removing its
    /// build request, without involving any worker.
    pub fn delete(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::DELETE.check(&instance)?;
        log::debug!("ComputeApi {}: going to try to terminate instance", instance.uuid);
        self.delete_instance(ctx, instance, DeleteType::Delete)
    }

    /// Deletes while keeping the instance restorable.
    pub fn soft_delete(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::SOFT_DELETE.check(&instance)?;
        log::debug!("ComputeApi {}: going to try to soft delete instance", instance.uuid);
        self.delete_instance(ctx, instance, DeleteType::SoftDelete)
    }

    pub fn force_delete(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::FORCE_DELETE.check(&instance)?;
        self.delete_instance(ctx, instance, DeleteType::ForceDelete)
    }

    /// Brings back a soft-deleted instance, charging its quota again.
    pub fn restore(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::RESTORE.check(&instance)?;

        let (_, reservation) = self.check_num_instances_quota(ctx, &instance.flavor, 1, 1)?;
        record_action_start(ctx, &instance, InstanceAction::Restore);

        let outcome = (|| {
            instance.deleted_at = None;
            if instance.host.is_some() {
                self.set_task_state(ctx, &mut instance, Some(TaskState::Restoring), &[None])?;
                self.cast_to_host(ctx, &instance, HostWorkOrder::RestoreInstance)
            } else {
                instance.vm_state = VmState::Active;
                instance.task_state = None;
                instance = self.resolver.save_instance(&instance, Some(&[None]))?;
                Ok(())
            }
        })();

        match outcome {
            Ok(()) => {
                reservation.commit()?;
                Ok(instance)
            }
            Err(e) => {
                reservation.rollback();
                Err(e)
            }
        }
    }

    //---------------------
    // --- Delete paths ---

    fn delete_instance(&self, ctx: &RequestContext, mut instance: Instance, delete_type: DeleteType) -> Result<()> {
        if instance.disable_terminate {
            log::info!("ComputeApi {}: instance termination disabled", instance.uuid);
            return Ok(());
        }

        if instance.host.is_none() {
            if self.delete_while_booting(&instance)? {
                return Ok(());
            }
            match self.resolver.lookup_instance(&instance.uuid)? {
                Some(found) => instance = found,
                None => return Ok(()),
            }
        }

        let bdms = self.resolver.get_bdms(&instance.uuid)?;

        if matches!(instance.vm_state, VmState::Shelved | VmState::ShelvedOffloaded) {
            self.delete_shelved_snapshot(ctx, &instance);
        }

        let original_task_state = instance.task_state;
        // Its quota was already released by the soft delete.
        let was_soft_deleted = instance.vm_state == VmState::SoftDeleted;
        instance.progress = 0;
        if delete_type == DeleteType::SoftDelete {
            instance.task_state = Some(TaskState::SoftDeleting);
            instance.deleted_at = Some(Utc::now());
        } else {
            instance.task_state = Some(TaskState::Deleting);
        }
        instance = match self.resolver.save_instance(&instance, None) {
            Ok(saved) => saved,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let reservation = self.reserve_deletion(&instance, original_task_state)?;
        let outcome = self.complete_delete(ctx, &mut instance, &bdms, delete_type, original_task_state);
        match outcome.map(|outcome| if was_soft_deleted { QuotaOutcome::Rollback } else { outcome }) {
            Ok(QuotaOutcome::Commit) => reservation.commit(),
            Ok(QuotaOutcome::Rollback) => {
                reservation.rollback();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                log::debug!("ComputeApi {}: instance vanished during delete: {}", instance.uuid, e);
                reservation.rollback();
                Ok(())
            }
            Err(e) => {
                reservation.rollback();
                Err(e)
            }
        }
    }

    /// Cancels a build that has not been placed yet. Returns `false` when the
    /// scheduler already consumed the build request.
    fn delete_while_booting(&self, instance: &Instance) -> Result<bool> {
        match self.resolver.store().destroy_build_request(&instance.uuid) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
        log::info!("ComputeApi {}: build request removed before placement", instance.uuid);

        let reservation = self.reserve_deletion(instance, instance.task_state)?;
        reservation.commit()?;

        if self.resolver.lookup_instance(&instance.uuid)?.is_some() {
            match self.resolver.database_for(&instance.uuid)?.destroy_instance(&instance.uuid) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn delete_shelved_snapshot(&self, ctx: &RequestContext, instance: &Instance) {
        let Some(snapshot_id) = instance.system_metadata.get(SHELVED_IMAGE_ID) else {
            return;
        };
        log::info!("ComputeApi {}: deleting snapshot {} of shelved instance", instance.uuid, snapshot_id);
        if let Err(e) = self.services.image_service.delete(ctx, &ImageId::new(snapshot_id.as_str())) {
            log::warn!("ComputeApi {}: failed to delete snapshot of shelved instance: {}", instance.uuid, e);
        }
    }

    /// Decrement of one instance. Mid-resize instances are still charged
    /// with the old flavor once the resize has moved them to the new one.
    fn reserve_deletion(&self, instance: &Instance, original_task_state: Option<TaskState>) -> Result<QuotaReservation> {
        let flavor = match (original_task_state, &instance.old_flavor) {
            (Some(TaskState::ResizeMigrated | TaskState::ResizeFinish), Some(old_flavor)) => old_flavor,
            _ => &instance.flavor,
        };
        self.quota.reserve(&instance_deltas(flavor, -1), &instance.project_id, Some(&instance.user_id))
    }

    fn complete_delete(
        &self,
        ctx: &RequestContext,
        instance: &mut Instance,
        bdms: &[BlockDeviceMapping],
        delete_type: DeleteType,
        original_task_state: Option<TaskState>,
    ) -> Result<QuotaOutcome> {
        if self.config.cell_type == Some(CellType::Api) {
            if instance.host.is_some() {
                self.cast_to_host(ctx, instance, delete_order(delete_type, bdms))?;
            }
            return Ok(QuotaOutcome::Commit);
        }

        let shelved_offloaded = instance.vm_state == VmState::ShelvedOffloaded;
        if instance.host.is_none() && !shelved_offloaded {
            notify_about_instance_usage(ctx, instance, &format!("{}.start", delete_type.as_str()));
            self.resolver.database_for(&instance.uuid)?.destroy_instance(&instance.uuid)?;
            notify_about_instance_usage(ctx, instance, &format!("{}.end", delete_type.as_str()));
            log::info!(
                "ComputeApi {}: instance deleted and does not have a host, its vm_state is {}",
                instance.uuid,
                instance.vm_state
            );
            return Ok(QuotaOutcome::Commit);
        }

        if instance.vm_state == VmState::Resized {
            self.confirm_resize_on_deleting(ctx, instance)?;
        }

        let mut local_delete = true;
        if let (false, Some(host)) = (shelved_offloaded, instance.host.as_ref()) {
            local_delete = match self.services.service_group.service_is_up(host) {
                Ok(up) => !up,
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e),
            };
        }

        if !local_delete {
            if matches!(original_task_state, Some(TaskState::Deleting | TaskState::SoftDeleting)) {
                log::info!("ComputeApi {}: instance is already in deleting state, ignoring this request", instance.uuid);
                return Ok(QuotaOutcome::Rollback);
            }
            record_action_start(ctx, instance, InstanceAction::Delete);
            self.cast_to_host(ctx, instance, delete_order(delete_type, bdms))?;
            return Ok(QuotaOutcome::Commit);
        }

        self.local_delete(ctx, instance, bdms, delete_type)?;
        Ok(QuotaOutcome::Commit)
    }

    /// A resized instance confirms its pending resize first so the source
    /// host releases the old allocation.
    fn confirm_resize_on_deleting(&self, ctx: &RequestContext, instance: &Instance) -> Result<()> {
        let database = self.resolver.database_for(&instance.uuid)?;
        let migration = [MigrationStatus::Finished, MigrationStatus::Confirming]
            .into_iter()
            .find_map(|status| database.get_migration_by_instance_and_status(&instance.uuid, status).ok());
        let Some((migration_id, migration)) = migration else {
            log::info!("ComputeApi {}: instance may have been confirmed during delete", instance.uuid);
            return Ok(());
        };
        log::info!(
            "ComputeApi {}: found an unconfirmed migration during delete, status {}",
            instance.uuid,
            migration.status
        );

        let Some(old_flavor) = instance.old_flavor.as_ref() else {
            log::info!("ComputeApi {}: migration may have been confirmed during delete", instance.uuid);
            return Ok(());
        };
        let reservation =
            self.quota.reserve(&downsize(&instance.flavor, old_flavor), &instance.project_id, Some(&instance.user_id))?;
        record_action_start(ctx, instance, InstanceAction::ConfirmResize);

        let source = migration.source_compute.clone().or_else(|| instance.host.clone());
        let dispatched = match source {
            Some(host) => self.services.compute_rpc.cast(ctx, &host, instance, HostWorkOrder::ConfirmResize { migration_id }),
            None => Ok(()),
        };
        match dispatched {
            Ok(()) => reservation.commit(),
            Err(e) => {
                reservation.rollback();
                Err(e)
            }
        }
    }

    /// Finishes a delete without the host's worker: releases networking,
    /// cleans up volumes and removes (or soft-deletes) the record.
    fn local_delete(
        &self,
        ctx: &RequestContext,
        instance: &mut Instance,
        bdms: &[BlockDeviceMapping],
        delete_type: DeleteType,
    ) -> Result<()> {
        if instance.vm_state == VmState::ShelvedOffloaded {
            log::info!("ComputeApi {}: instance is shelved offloaded, cleaning up its records", instance.uuid);
        } else {
            log::warn!(
                "ComputeApi {}: host {} is down, deleting from database",
                instance.uuid,
                instance.host.as_ref().map(|h| h.as_str()).unwrap_or("None")
            );
        }
        notify_about_instance_usage(ctx, instance, &format!("{}.start", delete_type.as_str()));

        let elevated = ctx.elevated();
        if self.config.cell_type != Some(CellType::Api) {
            if let Err(e) = self.services.network_service.deallocate_for_instance(&elevated, instance) {
                log::warn!("ComputeApi {}: failed to deallocate network: {}", instance.uuid, e);
            }
        }

        self.local_cleanup_bdm_volumes(ctx, instance, bdms);

        let database = self.resolver.database_for(&instance.uuid)?;
        database.take_bdms(&instance.uuid);
        if delete_type == DeleteType::SoftDelete {
            instance.vm_state = VmState::SoftDeleted;
            instance.task_state = None;
            instance.terminated_at = Some(Utc::now());
            *instance = self.resolver.save_instance(instance, None)?;
        } else {
            database.destroy_instance(&instance.uuid)?;
        }

        notify_about_instance_usage(ctx, instance, &format!("{}.end", delete_type.as_str()));
        Ok(())
    }

    pub(crate) fn local_cleanup_bdm_volumes(&self, ctx: &RequestContext, instance: &Instance, bdms: &[BlockDeviceMapping]) {
        let elevated = ctx.elevated();
        for bdm in bdms.iter().filter(|bdm| bdm.is_volume()) {
            let Some(volume_id) = bdm.volume_id.as_ref() else {
                continue;
            };
            let cleanup = || -> Result<()> {
                let instance_host = instance.host.as_ref().map(|h| h.as_str());
                match bdm.connector_host() {
                    Some(connector_host) if Some(connector_host.as_str()) == instance_host => {
                        self.services.volume_service.terminate_connection(ctx, volume_id, &connector_host)?;
                    }
                    _ => log::debug!(
                        "ComputeApi {}: no connector for volume {}, not terminating its connection",
                        instance.uuid,
                        volume_id
                    ),
                }
                self.services.volume_service.detach(&elevated, volume_id, &instance.uuid, None)?;
                if bdm.delete_on_termination {
                    self.services.volume_service.delete(ctx, volume_id)?;
                }
                Ok(())
            };
            if let Err(e) = cleanup() {
                log::warn!("ComputeApi {}: ignoring volume cleanup failure due to {}", instance.uuid, e);
            }
        }
    }
}

fn delete_order(delete_type: DeleteType, bdms: &[BlockDeviceMapping]) -> HostWorkOrder {
    match delete_type {
        DeleteType::SoftDelete => HostWorkOrder::SoftDeleteInstance,
        DeleteType::Delete | DeleteType::ForceDelete => HostWorkOrder::TerminateInstance { bdms: bdms.to_vec() },
    }
}

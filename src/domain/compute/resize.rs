use crate::domain::block_device::mapping::is_volume_backed;
use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::guard::{self, check_instance_host, check_instance_lock};
use crate::domain::compute::notifications::{InstanceAction, notify_about_instance_usage, record_action_start};
use crate::domain::config::CellType;
use crate::domain::context::RequestContext;
use crate::domain::instance::flavor::Flavor;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::migration::{Migration, MigrationId, MigrationStatus, MigrationType};
use crate::domain::instance::vm_state::TaskState;
use crate::domain::quota::deltas::{downsize, reverse_upsize, upsize};
use crate::domain::quota::headroom::{headroom, over_quota_detail};
use crate::domain::quota::ledger::QuotaDeltas;
use crate::domain::quota::reservation::QuotaReservation;
use crate::domain::services::compute_rpc::HostWorkOrder;
use crate::domain::services::conductor::{ConductorTask, FilterProperties, RequestedDestination};
use crate::domain::utils::id::{FlavorId, HostName, InstanceId};
use crate::error::{Error, Result};

impl ComputeApi {
    //---------------------
    // --- Resize and cold migration ---

    /// Resizes the instance to `flavor_id`, or cold-migrates it when no
    /// flavor is given.
    ///
    /// Only the growth between the two flavors is reserved. The reservation
    /// is committed once the conductor accepted the task.
    pub fn resize(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        flavor_id: Option<&FlavorId>,
        clean_shutdown: bool,
    ) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::RESIZE.check(&instance)?;

        let current_flavor = instance.flavor.clone();
        let new_flavor = match flavor_id {
            None => {
                log::debug!("ComputeApi {}: no flavor given, assuming migration", instance.uuid);
                current_flavor.clone()
            }
            Some(flavor_id) => {
                let new_flavor = self.services.flavors.get_by_flavor_id(flavor_id)?;
                if new_flavor.root_gb == 0 && current_flavor.root_gb != 0 {
                    let bdms = self.resolver.get_bdms(&instance.uuid)?;
                    if !is_volume_backed(instance.image_ref.as_ref(), &bdms) {
                        return Err(Error::CannotResizeDisk("Resize to zero disk flavor is not allowed.".to_string()));
                    }
                }
                new_flavor
            }
        };
        log::debug!(
            "ComputeApi {}: old flavor {}, new flavor {}",
            instance.uuid,
            current_flavor.name,
            new_flavor.name
        );

        let same_flavor = current_flavor.flavorid == new_flavor.flavorid;
        if !same_flavor && new_flavor.disabled {
            return Err(Error::not_found("Flavor", &new_flavor.flavorid));
        }
        if same_flavor && flavor_id.is_some() && self.config.cell_type != Some(CellType::Compute) {
            return Err(Error::CannotResizeToSameFlavor);
        }

        let database = self.resolver.database_for(&instance.uuid)?;
        let reservation = match flavor_id {
            Some(_) => self.reserve_resize(ctx, &instance, &upsize(&new_flavor, &current_flavor))?,
            None => QuotaReservation::empty(),
        };

        instance.progress = 0;
        instance.old_flavor = Some(current_flavor.clone());
        instance.new_flavor = Some(new_flavor.clone());
        if let Err(e) = self.set_task_state(ctx, &mut instance, Some(TaskState::ResizePrep), &[None]) {
            reservation.rollback();
            return Err(e);
        }

        let mut filter_properties = FilterProperties::default();
        if !self.config.allow_resize_to_same_host {
            filter_properties.ignore_hosts.extend(instance.host.clone());
        }

        let migration_type = if same_flavor { MigrationType::Migration } else { MigrationType::Resize };
        let mut migration = Migration::new(instance.uuid.clone(), migration_type, MigrationStatus::Queued);
        migration.source_compute = instance.host.clone();
        migration.source_node = instance.node.clone();
        migration.old_instance_type_id = Some(current_flavor.flavorid.clone());
        migration.new_instance_type_id = Some(new_flavor.flavorid.clone());

        if self.config.cell_type == Some(CellType::Api) {
            // The API cell never hears back from the child, so the record is final.
            migration.status = MigrationStatus::Finished;
            database.create_migration(migration);
            reservation.commit()?;
            self.record_resize_start(ctx, &instance, flavor_id.is_some());
            self.submit_resize(ctx, &instance, new_flavor, filter_properties, clean_shutdown)?;
            return Ok(instance);
        }

        database.create_migration(migration);
        self.record_resize_start(ctx, &instance, flavor_id.is_some());
        match self.submit_resize(ctx, &instance, new_flavor, filter_properties, clean_shutdown) {
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

    /// Cold migration: a resize that keeps the current flavor.
    pub fn migrate(&self, ctx: &RequestContext, instance_uuid: &InstanceId, clean_shutdown: bool) -> Result<Instance> {
        self.resize(ctx, instance_uuid, None, clean_shutdown)
    }

    /// Accepts a finished resize. Only the shrinkage between the old and the
    /// new flavor is reserved, so the source host can free what is no longer
    /// used.
    pub fn confirm_resize(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::CONFIRM_RESIZE.check(&instance)?;

        let database = self.resolver.database_for(&instance.uuid)?;
        let (migration_id, mut migration) =
            database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Finished)?;

        let deltas = match &instance.old_flavor {
            Some(old_flavor) => downsize(&instance.flavor, old_flavor),
            None => QuotaDeltas::new(),
        };
        let reservation = self.quota.reserve(&deltas, &instance.project_id, Some(&instance.user_id))?;

        migration.status = MigrationStatus::Confirming;
        let source = migration.source_compute.clone();
        if let Err(e) = database.save_migration(migration_id, migration.clone()) {
            reservation.rollback();
            return Err(e);
        }

        record_action_start(ctx, &instance, InstanceAction::ConfirmResize);
        let dispatched = match source.as_ref().or(instance.host.as_ref()) {
            Some(host) => self.services.compute_rpc.cast(ctx, host, &instance, HostWorkOrder::ConfirmResize { migration_id }),
            None => Err(Error::InstanceNotReady(instance.uuid.clone())),
        };
        if dispatched.is_err() {
            migration.status = MigrationStatus::Finished;
            if let Err(e) = database.save_migration(migration_id, migration) {
                log::warn!("ComputeApi {}: failed to reset migration {:?} to finished: {}", instance.uuid, migration_id, e);
            }
        }
        finish_reservation(reservation, dispatched)?;
        Ok(instance)
    }

    /// Rolls a finished resize back to the old flavor on the source host.
    pub fn revert_resize(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::REVERT_RESIZE.check(&instance)?;

        let database = self.resolver.database_for(&instance.uuid)?;
        let (migration_id, mut migration) =
            database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Finished)?;

        let deltas = match &instance.old_flavor {
            Some(old_flavor) => reverse_upsize(&instance.flavor, old_flavor),
            None => QuotaDeltas::new(),
        };
        let reservation = self.quota.reserve(&deltas, &instance.project_id, Some(&instance.user_id))?;

        if let Err(e) = self.set_task_state(ctx, &mut instance, Some(TaskState::ResizeReverting), &[None]) {
            reservation.rollback();
            return Err(e);
        }

        migration.status = MigrationStatus::Reverting;
        let destination = migration.dest_compute.clone();
        if let Err(e) = database.save_migration(migration_id, migration) {
            reservation.rollback();
            return Err(e);
        }

        record_action_start(ctx, &instance, InstanceAction::RevertResize);
        let dispatched = match destination.as_ref().or(instance.host.as_ref()) {
            Some(host) => self.services.compute_rpc.cast(ctx, host, &instance, HostWorkOrder::RevertResize { migration_id }),
            None => Err(Error::InstanceNotReady(instance.uuid.clone())),
        };
        finish_reservation(reservation, dispatched)?;
        Ok(instance)
    }

    fn reserve_resize(&self, ctx: &RequestContext, instance: &Instance, deltas: &QuotaDeltas) -> Result<QuotaReservation> {
        let detail = match self.quota.reserve(deltas, &instance.project_id, Some(&instance.user_id)) {
            Ok(reservation) => return Ok(reservation),
            Err(Error::OverQuota(detail)) => detail,
            Err(e) => return Err(e),
        };
        let headroom = headroom(&detail.quotas, &detail.usages, deltas);
        let (overs, req, used, allowed) = over_quota_detail(&headroom, &detail.overs, &detail.quotas, deltas);
        log::warn!("ComputeApi {}: {} quota exceeded for {}, tried to resize instance", instance.uuid, overs, ctx.project_id);
        Err(Error::TooManyInstances {
            overs,
            req,
            used,
            allowed,
            headroom: None,
            message: "Quota exceeded while resizing the instance.".to_string(),
        })
    }

    fn record_resize_start(&self, ctx: &RequestContext, instance: &Instance, resizing: bool) {
        let action = if resizing { InstanceAction::Resize } else { InstanceAction::Migrate };
        record_action_start(ctx, instance, action);
    }

    fn submit_resize(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        flavor: Flavor,
        filter_properties: FilterProperties,
        clean_shutdown: bool,
    ) -> Result<()> {
        self.services.compute_task_api.submit(
            ctx,
            ConductorTask::ResizeInstance { instance: instance.clone(), flavor, filter_properties, clean_shutdown },
        )
    }

    //---------------------
    // --- Live migration ---

    /// Moves a running instance to `host_name`, or to a host the scheduler
    /// picks when none is given.
    pub fn live_migrate(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        block_migration: bool,
        disk_over_commit: bool,
        host_name: Option<HostName>,
    ) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::LIVE_MIGRATE.check(&instance)?;

        log::debug!(
            "ComputeApi {}: going to try to live migrate instance to {}",
            instance.uuid,
            host_name.as_ref().map(|h| h.to_string()).unwrap_or_else(|| "another host".to_string())
        );
        self.set_task_state(ctx, &mut instance, Some(TaskState::Migrating), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::LiveMigration);

        self.services.compute_task_api.submit(
            ctx,
            ConductorTask::LiveMigrateInstance {
                instance: instance.clone(),
                block_migration,
                disk_over_commit,
                requested_destination: host_name.map(|host| RequestedDestination { host, node: None }),
            },
        )?;
        Ok(instance)
    }

    pub fn live_migrate_force_complete(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        migration_id: MigrationId,
    ) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::LIVE_MIGRATE_FORCE_COMPLETE.check(&instance)?;

        self.running_live_migration(&instance, migration_id, "force complete")?;
        record_action_start(ctx, &instance, InstanceAction::LiveMigrationForceComplete);
        self.cast_to_host(ctx, &instance, HostWorkOrder::LiveMigrationForceComplete { migration_id })
    }

    pub fn live_migrate_abort(&self, ctx: &RequestContext, instance_uuid: &InstanceId, migration_id: MigrationId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::LIVE_MIGRATE_ABORT.check(&instance)?;

        log::debug!("ComputeApi {}: going to cancel live migration {:?}", instance.uuid, migration_id);
        self.running_live_migration(&instance, migration_id, "abort live migration")?;
        record_action_start(ctx, &instance, InstanceAction::LiveMigrationAbort);
        self.cast_to_host(ctx, &instance, HostWorkOrder::LiveMigrationAbort { migration_id })
    }

    /// The migration must belong to the instance and still be running.
    fn running_live_migration(&self, instance: &Instance, migration_id: MigrationId, method: &'static str) -> Result<Migration> {
        let migration = self.resolver.database_for(&instance.uuid)?.get_migration(migration_id)?;
        if migration.instance_uuid != instance.uuid {
            return Err(Error::not_found("Migration", format!("{:?}", migration_id)));
        }
        if migration.status != MigrationStatus::Running {
            return Err(Error::InvalidMigrationState {
                migration_id: format!("{:?}", migration_id),
                instance_id: instance.uuid.clone(),
                state: migration.status.to_string(),
                method,
            });
        }
        Ok(migration)
    }

    //---------------------
    // --- Evacuation ---

    /// Rebuilds the instance elsewhere after its host went down.
    ///
    /// # Errors
    /// `ComputeServiceInUse` while the worker on the current host still
    /// reports as up.
    pub fn evacuate(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        host: Option<HostName>,
        on_shared_storage: bool,
        admin_password: Option<String>,
    ) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        guard::EVACUATE.check(&instance)?;

        log::debug!("ComputeApi {}: vm evacuation scheduled", instance.uuid);
        let source_host = check_instance_host(&instance)?.clone();
        if self.services.service_group.service_is_up(&source_host)? {
            log::error!("ComputeApi {}: compute service on {} expected to be down, but it was up", instance.uuid, source_host);
            return Err(Error::ComputeServiceInUse { host: source_host });
        }

        self.set_task_state(ctx, &mut instance, Some(TaskState::Rebuilding), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Evacuate);

        let mut migration = Migration::new(instance.uuid.clone(), MigrationType::Evacuation, MigrationStatus::Accepted);
        migration.source_compute = Some(source_host);
        migration.source_node = instance.node.clone();
        migration.dest_compute = host.clone();
        self.resolver.database_for(&instance.uuid)?.create_migration(migration);

        notify_about_instance_usage(ctx, &instance, "evacuate");

        self.services.compute_task_api.submit(
            ctx,
            ConductorTask::RebuildInstance {
                instance: instance.clone(),
                orig_image_ref: instance.image_ref.clone(),
                image_ref: instance.image_ref.clone(),
                new_pass: admin_password,
                injected_files: Vec::new(),
                orig_sys_metadata: instance.system_metadata.clone(),
                preserve_ephemeral: false,
                recreate: true,
                on_shared_storage,
                host: host.clone(),
                requested_destination: host.map(|host| RequestedDestination { host, node: None }),
            },
        )?;
        Ok(instance)
    }
}

/// Commits once the worker accepted the order, rolls back otherwise.
fn finish_reservation(reservation: QuotaReservation, dispatched: Result<()>) -> Result<()> {
    match dispatched {
        Ok(()) => reservation.commit(),
        Err(e) => {
            reservation.rollback();
            Err(e)
        }
    }
}

mod common;

use std::collections::BTreeMap;

use common::{HOST, Harness};
use compute_orchestrator::domain::block_device::mapping::BlockDeviceMapping;
use compute_orchestrator::domain::block_device::resolver::BlockDeviceRequest;
use compute_orchestrator::domain::compute::{CreateRequest, RebuildRequest};
use compute_orchestrator::domain::instance::flavor::Flavor;
use compute_orchestrator::domain::instance::instance::Instance;
use compute_orchestrator::domain::instance::migration::{Migration, MigrationStatus, MigrationType};
use compute_orchestrator::domain::instance::vm_state::{TaskState, VmState};
use compute_orchestrator::domain::quota::resource::QuotaResource;
use compute_orchestrator::domain::services::compute_rpc::{HostWorkOrder, MetadataChange, RebootType};
use compute_orchestrator::domain::services::image::{ImageMeta, ImageService};
use compute_orchestrator::domain::services::volume::{Volume, VolumeService, VolumeStatus};
use compute_orchestrator::domain::utils::id::{FlavorId, HostName, ImageId, InstanceId, VolumeId};
use compute_orchestrator::error::{Error, ErrorKind};

const DEST_HOST: &str = "compute-2";

fn host() -> HostName {
    HostName::new(HOST)
}

/// What the destination host does once a resize has been carried out.
fn finish_resize(h: &Harness, uuid: &InstanceId, new_flavor: Flavor) -> Instance {
    let database = h.api.resolver().database_for(uuid).unwrap();
    let (migration_id, mut migration) = database.get_migration_by_instance_and_status(uuid, MigrationStatus::Queued).unwrap();
    migration.status = MigrationStatus::Finished;
    migration.dest_compute = Some(HostName::new(DEST_HOST));
    database.save_migration(migration_id, migration).unwrap();

    let mut instance = h.api.resolver().get_instance(uuid).unwrap();
    instance.flavor = new_flavor;
    instance.vm_state = VmState::Resized;
    instance.task_state = None;
    h.api.resolver().save_instance(&instance, None).unwrap()
}

/// Boots from a bootable volume and attaches it, as the host would.
fn boot_from_volume(h: &Harness) -> Instance {
    h.volumes.add_volume(Volume::available("vol-boot", 10).bootable());
    let volume_id = VolumeId::new("vol-boot");
    let devices = BlockDeviceRequest::Current(vec![BlockDeviceMapping::volume(volume_id.clone()).with_boot_index(0)]);
    let request = CreateRequest::new(common::small_flavor(), None).with_block_devices(devices);
    let (mut instances, _) = h.api.create(&h.ctx(), request).unwrap();
    let instance = h.launch(&instances.remove(0).uuid);
    h.volumes.attach(&h.ctx(), &volume_id, &instance.uuid, "/dev/vda").unwrap();
    instance
}

//---------------------
// --- Power ---

#[test]
fn stop_requires_an_idle_running_instance() {
    let h = Harness::new();

    let pending = h.boot_pending();
    let err = h.api.stop(&h.ctx(), &pending.uuid, true).unwrap_err();
    assert!(matches!(err, Error::InvalidState { attr: "vm_state", method: "stop", .. }));

    let active = h.boot_active();
    let stopped = h.api.stop(&h.ctx(), &active.uuid, true).unwrap();
    assert_eq!(stopped.task_state, Some(TaskState::PoweringOff));
    assert_eq!(h.rpc.verbs_for(&active.uuid), vec!["stop_instance"]);

    let err = h.api.stop(&h.ctx(), &active.uuid, true).unwrap_err();
    assert!(matches!(err, Error::InvalidState { attr: "task_state", .. }));
}

#[test]
fn start_only_from_stopped() {
    let h = Harness::new();
    let instance = h.boot_active();

    assert!(matches!(h.api.start(&h.ctx(), &instance.uuid), Err(Error::InvalidState { .. })));

    h.set_states(&instance.uuid, VmState::Stopped, None);
    let starting = h.api.start(&h.ctx(), &instance.uuid).unwrap();
    assert_eq!(starting.task_state, Some(TaskState::PoweringOn));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["start_instance"]);
}

#[test]
fn soft_reboot_can_be_escalated_to_hard() {
    let h = Harness::new();
    let instance = h.boot_active();

    let rebooting = h.api.reboot(&h.ctx(), &instance.uuid, RebootType::Soft).unwrap();
    assert_eq!(rebooting.task_state, Some(TaskState::Rebooting));

    let err = h.api.reboot(&h.ctx(), &instance.uuid, RebootType::Soft).unwrap_err();
    assert!(matches!(err, Error::InvalidState { attr: "task_state", .. }));

    let hard = h.api.reboot(&h.ctx(), &instance.uuid, RebootType::Hard).unwrap();
    assert_eq!(hard.task_state, Some(TaskState::RebootingHard));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["reboot_instance", "reboot_instance"]);
}

#[test]
fn hard_reboot_recovers_an_errored_instance() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.set_states(&instance.uuid, VmState::Error, None);

    assert!(h.api.reboot(&h.ctx(), &instance.uuid, RebootType::Soft).is_err());
    let rebooting = h.api.reboot(&h.ctx(), &instance.uuid, RebootType::Hard).unwrap();
    assert_eq!(rebooting.task_state, Some(TaskState::RebootingHard));
}

#[test]
fn pause_and_suspend_round_trips() {
    let h = Harness::new();
    let instance = h.boot_active();
    let uuid = &instance.uuid;

    assert!(matches!(h.api.unpause(&h.ctx(), uuid), Err(Error::InvalidState { method: "unpause", .. })));
    assert_eq!(h.api.pause(&h.ctx(), uuid).unwrap().task_state, Some(TaskState::Pausing));
    h.set_states(uuid, VmState::Paused, None);
    assert!(matches!(h.api.suspend(&h.ctx(), uuid), Err(Error::InvalidState { method: "suspend", .. })));
    assert_eq!(h.api.unpause(&h.ctx(), uuid).unwrap().task_state, Some(TaskState::Unpausing));
    h.set_states(uuid, VmState::Active, None);

    assert_eq!(h.api.suspend(&h.ctx(), uuid).unwrap().task_state, Some(TaskState::Suspending));
    h.set_states(uuid, VmState::Suspended, None);
    assert_eq!(h.api.resume(&h.ctx(), uuid).unwrap().task_state, Some(TaskState::Resuming));

    assert_eq!(
        h.rpc.verbs_for(uuid),
        vec!["pause_instance", "unpause_instance", "suspend_instance", "resume_instance"]
    );
}

//---------------------
// --- Locking ---

#[test]
fn locked_instance_rejects_its_owner_but_not_admins() {
    let h = Harness::new();
    let instance = h.boot_active();

    let locked = h.api.lock(&h.ctx(), &instance.uuid).unwrap();
    assert!(locked.locked);

    assert!(matches!(h.api.stop(&h.ctx(), &instance.uuid, true), Err(Error::InstanceLocked(_))));
    assert!(h.api.stop(&h.admin(), &instance.uuid, true).is_ok());

    let unlocked = h.api.unlock(&h.ctx(), &instance.uuid).unwrap();
    assert!(!unlocked.locked);
    assert!(unlocked.locked_by.is_none());
}

#[test]
fn locked_instance_can_only_be_deleted_by_an_admin() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.service_group.set_host(&host(), true);
    h.api.lock(&h.ctx(), &instance.uuid).unwrap();

    let err = h.api.delete(&h.ctx(), &instance.uuid).unwrap_err();
    assert!(matches!(err, Error::InstanceLocked(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(h.rpc.verbs_for(&instance.uuid).is_empty());

    h.api.delete(&h.admin(), &instance.uuid).unwrap();
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["terminate_instance"]);
}

#[test]
fn owner_cannot_lift_an_admin_lock() {
    let h = Harness::new();
    let instance = h.boot_active();

    h.api.lock(&h.admin(), &instance.uuid).unwrap();

    assert!(matches!(h.api.unlock(&h.ctx(), &instance.uuid), Err(Error::InstanceLocked(_))));
    assert!(h.api.unlock(&h.admin(), &instance.uuid).is_ok());
}

#[test]
fn other_projects_cannot_see_the_instance() {
    let h = Harness::new();
    let instance = h.boot_active();
    let stranger = compute_orchestrator::domain::context::RequestContext::new("project-b", "user-b");

    assert!(matches!(h.api.stop(&stranger, &instance.uuid, true), Err(Error::NotFound { kind: "Instance", .. })));
}

//---------------------
// --- Delete ---

#[test]
fn deleting_a_pending_instance_cancels_its_build() {
    let h = Harness::new();
    let instance = h.boot_pending();
    assert_eq!(h.instance_usage(), (1, 1, 512));

    h.api.delete(&h.ctx(), &instance.uuid).unwrap();

    let store = h.api.resolver().store();
    assert_eq!(store.pending_build_requests(), 0);
    assert!(h.api.resolver().lookup_instance(&instance.uuid).unwrap().is_none());
    assert!(store.get_instance_mapping(&instance.uuid).is_ok());
    assert_eq!(h.instance_usage(), (0, 0, 0));
    assert!(h.rpc.orders().is_empty());
}

#[test]
fn delete_with_live_host_goes_through_the_worker() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.service_group.set_host(&host(), true);

    h.api.delete(&h.ctx(), &instance.uuid).unwrap();

    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["terminate_instance"]);
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.task_state, Some(TaskState::Deleting));
    assert_eq!(h.instance_usage(), (0, 0, 0));
    assert_eq!(h.quota.pending_reservations(), 0);
}

#[test]
fn delete_with_dead_host_is_completed_locally() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.service_group.set_host(&host(), false);

    h.api.delete(&h.ctx(), &instance.uuid).unwrap();

    assert!(h.rpc.orders().is_empty());
    assert!(h.api.resolver().lookup_instance(&instance.uuid).unwrap().is_none());
    assert_eq!(h.network.deallocations(), vec![instance.uuid.clone()]);
    assert!(h.api.resolver().store().get_instance_mapping(&instance.uuid).is_ok());
    assert_eq!(h.instance_usage(), (0, 0, 0));
}

#[test]
fn unknown_host_service_counts_as_down() {
    let h = Harness::new();
    let instance = h.boot_active();

    h.api.delete(&h.ctx(), &instance.uuid).unwrap();

    assert!(h.rpc.orders().is_empty());
    assert!(h.api.resolver().lookup_instance(&instance.uuid).unwrap().is_none());
}

#[test]
fn soft_deleted_instance_can_be_restored() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.service_group.set_host(&host(), false);

    h.api.soft_delete(&h.ctx(), &instance.uuid).unwrap();

    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.vm_state, VmState::SoftDeleted);
    assert_eq!(h.instance_usage(), (0, 0, 0));

    let restored = h.api.restore(&h.ctx(), &instance.uuid).unwrap();
    assert_eq!(restored.task_state, Some(TaskState::Restoring));
    assert!(restored.deleted_at.is_none());
    assert_eq!(h.instance_usage(), (1, 1, 512));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["restore_instance"]);
}

#[test]
fn deleting_a_soft_deleted_instance_releases_its_quota_once() {
    let h = Harness::new();
    let first = h.boot_active();
    h.boot_active();
    h.service_group.set_host(&host(), false);

    h.api.soft_delete(&h.ctx(), &first.uuid).unwrap();
    assert_eq!(h.in_use(QuotaResource::Instances), 1);

    h.api.delete(&h.ctx(), &first.uuid).unwrap();
    assert_eq!(h.instance_usage(), (1, 1, 512));
    assert!(h.api.resolver().lookup_instance(&first.uuid).unwrap().is_none());
    assert_eq!(h.quota.pending_reservations(), 0);
}

#[test]
fn force_deleting_a_soft_deleted_instance_releases_its_quota_once() {
    let h = Harness::new();
    let first = h.boot_active();
    h.boot_active();
    h.service_group.set_host(&host(), false);

    h.api.soft_delete(&h.ctx(), &first.uuid).unwrap();
    h.api.force_delete(&h.ctx(), &first.uuid).unwrap();

    assert_eq!(h.instance_usage(), (1, 1, 512));
}

#[test]
fn deleting_a_shelved_instance_drops_its_snapshot() {
    let h = Harness::new();
    let instance = h.boot_active();
    let shelving = h.api.shelve(&h.ctx(), &instance.uuid, true).unwrap();
    let snapshot = ImageId::new(shelving.system_metadata["shelved_image_id"].as_str());
    h.set_states(&instance.uuid, VmState::ShelvedOffloaded, None);

    h.api.delete(&h.ctx(), &instance.uuid).unwrap();

    assert!(!h.images.contains(&snapshot));
    assert!(h.api.resolver().lookup_instance(&instance.uuid).unwrap().is_none());
    assert_eq!(h.instance_usage(), (0, 0, 0));
}

//---------------------
// --- Resize ---

#[test]
fn resize_to_the_same_flavor_is_rejected() {
    let h = Harness::new();
    let instance = h.boot_active();

    let err = h.api.resize(&h.ctx(), &instance.uuid, Some(&FlavorId::new("m1.small")), true).unwrap_err();

    assert!(matches!(err, Error::CannotResizeToSameFlavor));
    assert_eq!(h.quota.pending_reservations(), 0);
}

#[test]
fn resize_charges_growth_and_revert_gives_it_back() {
    let h = Harness::new();
    let instance = h.boot_active();

    let resizing = h.api.resize(&h.ctx(), &instance.uuid, Some(&FlavorId::new("m1.medium")), true).unwrap();

    assert_eq!(resizing.task_state, Some(TaskState::ResizePrep));
    assert_eq!(resizing.old_flavor.as_ref().map(|f| f.flavorid.as_str()), Some("m1.small"));
    assert_eq!(h.instance_usage(), (1, 2, 1024));
    assert_eq!(h.conductor.task_names(), vec!["build_instances", "resize_instance"]);
    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    assert!(database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Queued).is_ok());

    finish_resize(&h, &instance.uuid, common::medium_flavor());
    let reverting = h.api.revert_resize(&h.ctx(), &instance.uuid).unwrap();

    assert_eq!(reverting.task_state, Some(TaskState::ResizeReverting));
    assert_eq!(h.instance_usage(), (1, 1, 512));
    assert!(database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Reverting).is_ok());
    let order = h.rpc.orders().pop().unwrap();
    assert_eq!(order.host, HostName::new(DEST_HOST));
    assert_eq!(order.order.verb(), "revert_resize");
}

#[test]
fn confirming_a_downsize_releases_the_difference() {
    let h = Harness::new();
    h.flavors.add(Flavor::new("m1.tiny", 1, 256, 1));
    let instance = h.boot_active();

    h.api.resize(&h.ctx(), &instance.uuid, Some(&FlavorId::new("m1.tiny")), true).unwrap();
    assert_eq!(h.instance_usage(), (1, 1, 512));

    finish_resize(&h, &instance.uuid, Flavor::new("m1.tiny", 1, 256, 1));
    h.api.confirm_resize(&h.ctx(), &instance.uuid).unwrap();

    assert_eq!(h.instance_usage(), (1, 1, 256));
    let order = h.rpc.orders().pop().unwrap();
    assert_eq!((order.host, order.order.verb()), (host(), "confirm_resize"));
    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    assert!(database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Confirming).is_ok());
}

#[test]
fn confirm_requires_a_resized_instance() {
    let h = Harness::new();
    let instance = h.boot_active();

    let err = h.api.confirm_resize(&h.ctx(), &instance.uuid).unwrap_err();
    assert!(matches!(err, Error::InvalidState { method: "confirm_resize", .. }));
}

#[test]
fn resize_beyond_quota_is_refused() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.quota.set_project_limit(&h.ctx().project_id, QuotaResource::Cores, 1);

    let err = h.api.resize(&h.ctx(), &instance.uuid, Some(&FlavorId::new("m1.medium")), true).unwrap_err();

    assert!(matches!(err, Error::TooManyInstances { headroom: None, .. }));
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.task_state, None);
    assert_eq!(h.instance_usage(), (1, 1, 512));
}

#[test]
fn refused_confirm_puts_the_migration_back() {
    let h = Harness::builder().refuse_host_order("confirm_resize").build();
    h.flavors.add(Flavor::new("m1.tiny", 1, 256, 1));
    let instance = h.boot_active();
    h.api.resize(&h.ctx(), &instance.uuid, Some(&FlavorId::new("m1.tiny")), true).unwrap();
    finish_resize(&h, &instance.uuid, Flavor::new("m1.tiny", 1, 256, 1));

    let err = h.api.confirm_resize(&h.ctx(), &instance.uuid).unwrap_err();

    assert!(matches!(err, Error::ExternalService { service: "compute", .. }));
    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    assert!(database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Finished).is_ok());
    assert!(database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Confirming).is_err());
    assert_eq!(h.instance_usage(), (1, 1, 512));
    assert_eq!(h.quota.pending_reservations(), 0);

    let retried = h.api.confirm_resize(&h.ctx(), &instance.uuid).unwrap_err();
    assert!(matches!(retried, Error::ExternalService { .. }));
}

//---------------------
// --- Migration and evacuation ---

#[test]
fn evacuate_refuses_a_live_host() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.service_group.set_host(&host(), true);

    let err = h.api.evacuate(&h.admin(), &instance.uuid, None, false, None).unwrap_err();
    assert!(matches!(err, Error::ComputeServiceInUse { .. }));

    h.service_group.set_host(&host(), false);
    let evacuating = h.api.evacuate(&h.admin(), &instance.uuid, Some(HostName::new(DEST_HOST)), true, None).unwrap();

    assert_eq!(evacuating.task_state, Some(TaskState::Rebuilding));
    assert_eq!(h.conductor.task_names().last().copied(), Some("rebuild_instance"));
    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    let (_, migration) = database.get_migration_by_instance_and_status(&instance.uuid, MigrationStatus::Accepted).unwrap();
    assert_eq!(migration.migration_type, MigrationType::Evacuation);
    assert_eq!(migration.source_compute, Some(host()));
}

#[test]
fn live_migration_abort_needs_a_running_migration() {
    let h = Harness::new();
    let instance = h.boot_active();

    let migrating = h.api.live_migrate(&h.admin(), &instance.uuid, false, false, None).unwrap();
    assert_eq!(migrating.task_state, Some(TaskState::Migrating));
    assert_eq!(h.conductor.task_names().last().copied(), Some("live_migrate_instance"));

    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    let queued = database.create_migration(Migration::new(instance.uuid.clone(), MigrationType::LiveMigration, MigrationStatus::Queued));
    let err = h.api.live_migrate_abort(&h.admin(), &instance.uuid, queued).unwrap_err();
    assert!(matches!(err, Error::InvalidMigrationState { state, .. } if state == "queued"));

    let running = database.create_migration(Migration::new(instance.uuid.clone(), MigrationType::LiveMigration, MigrationStatus::Running));
    h.api.live_migrate_abort(&h.admin(), &instance.uuid, running).unwrap();
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["live_migration_abort"]);
}

#[test]
fn running_live_migration_can_be_forced_to_complete() {
    let h = Harness::new();
    let instance = h.boot_active();

    let migrating = h.api.live_migrate(&h.admin(), &instance.uuid, true, false, Some(HostName::new(DEST_HOST))).unwrap();
    assert_eq!(migrating.task_state, Some(TaskState::Migrating));
    assert_eq!(h.conductor.task_names(), vec!["build_instances", "live_migrate_instance"]);

    let database = h.api.resolver().database_for(&instance.uuid).unwrap();
    let running = database.create_migration(Migration::new(instance.uuid.clone(), MigrationType::LiveMigration, MigrationStatus::Running));
    h.api.live_migrate_force_complete(&h.admin(), &instance.uuid, running).unwrap();
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["live_migration_force_complete"]);
}

//---------------------
// --- Rebuild and rescue ---

#[test]
fn rebuild_checks_the_new_image() {
    let h = Harness::new();
    let instance = h.boot_active();
    let oversized = h.images.add(ImageMeta { size: 2 * 1024 * 1024 * 1024, ..ImageMeta::active("oversized") });

    let request = RebuildRequest { image_href: Some(oversized), ..Default::default() };
    let err = h.api.rebuild(&h.ctx(), &instance.uuid, request).unwrap_err();
    assert!(matches!(err, Error::FlavorDiskSmallerThanImage { .. }));
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.task_state, None);
    assert_eq!(record.image_ref.as_ref(), Some(&h.image_id));

    let replacement = h.images.add(ImageMeta::active("replacement"));
    let request = RebuildRequest { image_href: Some(replacement.clone()), ..Default::default() };
    let rebuilding = h.api.rebuild(&h.ctx(), &instance.uuid, request).unwrap();
    assert_eq!(rebuilding.task_state, Some(TaskState::Rebuilding));
    assert_eq!(rebuilding.image_ref, Some(replacement));
    assert_eq!(h.conductor.task_names().last().copied(), Some("rebuild_instance"));
}

#[test]
fn rescue_and_unrescue_go_to_the_host() {
    let h = Harness::new();
    let instance = h.boot_active();

    let rescuing = h.api.rescue(&h.ctx(), &instance.uuid, None, None, true).unwrap();
    assert_eq!(rescuing.task_state, Some(TaskState::Rescuing));
    h.set_states(&instance.uuid, VmState::Rescued, None);
    let unrescuing = h.api.unrescue(&h.ctx(), &instance.uuid).unwrap();
    assert_eq!(unrescuing.task_state, Some(TaskState::Unrescuing));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["rescue_instance", "unrescue_instance"]);
}

#[test]
fn volume_backed_instance_cannot_be_rescued() {
    let h = Harness::new();
    let instance = boot_from_volume(&h);

    let err = h.api.rescue(&h.ctx(), &instance.uuid, None, None, true).unwrap_err();

    assert!(matches!(err, Error::InstanceNotRescuable { .. }));
    assert_eq!(h.api.resolver().get_instance(&instance.uuid).unwrap().task_state, None);
    assert!(h.rpc.verbs_for(&instance.uuid).is_empty());
}

//---------------------
// --- Shelve ---

#[test]
fn image_backed_shelve_snapshots_before_offloading() {
    let h = Harness::new();
    let instance = h.boot_active();

    let shelving = h.api.shelve(&h.ctx(), &instance.uuid, true).unwrap();
    assert_eq!(shelving.task_state, Some(TaskState::Shelving));
    let snapshot = ImageId::new(shelving.system_metadata["shelved_image_id"].as_str());
    assert!(h.images.contains(&snapshot));

    h.set_states(&instance.uuid, VmState::Shelved, None);
    let offloading = h.api.shelve_offload(&h.ctx(), &instance.uuid, true).unwrap();
    assert_eq!(offloading.task_state, Some(TaskState::ShelvingOffloading));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["shelve_instance", "shelve_offload_instance"]);

    h.set_states(&instance.uuid, VmState::ShelvedOffloaded, None);
    let unshelving = h.api.unshelve(&h.ctx(), &instance.uuid).unwrap();
    assert_eq!(unshelving.task_state, Some(TaskState::Unshelving));
    assert_eq!(h.conductor.task_names().last().copied(), Some("unshelve_instance"));
}

#[test]
fn volume_backed_shelve_offloads_without_a_snapshot() {
    let h = Harness::new();
    let instance = boot_from_volume(&h);

    let shelving = h.api.shelve(&h.ctx(), &instance.uuid, true).unwrap();

    assert_eq!(shelving.task_state, Some(TaskState::Shelving));
    assert!(!shelving.system_metadata.contains_key("shelved_image_id"));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["shelve_offload_instance"]);
}

//---------------------
// --- Snapshots and backups ---

#[test]
fn snapshot_and_backup_register_images() {
    let h = Harness::new();
    let instance = h.boot_active();

    let snapshot = h.api.snapshot(&h.ctx(), &instance.uuid, "snap", BTreeMap::new()).unwrap();
    assert!(h.images.contains(&snapshot));
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.task_state, Some(TaskState::ImageSnapshotPending));

    h.set_states(&instance.uuid, VmState::Active, None);
    let backup = h.api.backup(&h.ctx(), &instance.uuid, "nightly", "daily", 2, BTreeMap::new()).unwrap();
    let image = h.images.get(&h.ctx(), &backup).unwrap();
    assert_eq!(image.property_str("image_type").as_deref(), Some("backup"));
    assert_eq!(image.property_str("backup_type").as_deref(), Some("daily"));
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert_eq!(record.task_state, Some(TaskState::ImageBackup));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["snapshot_instance", "backup_instance"]);
}

#[test]
fn volume_backed_instance_cannot_be_backed_up() {
    let h = Harness::new();
    let instance = boot_from_volume(&h);

    let err = h.api.backup(&h.ctx(), &instance.uuid, "nightly", "daily", 2, BTreeMap::new()).unwrap_err();

    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(h.rpc.verbs_for(&instance.uuid).is_empty());
}

//---------------------
// --- Volumes ---

#[test]
fn attach_volume_reserves_it_and_records_the_device() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.volumes.add_volume(Volume::available("vol-data", 5));
    let volume_id = VolumeId::new("vol-data");

    let device = h.api.attach_volume(&h.ctx(), &instance.uuid, &volume_id, None).unwrap();

    assert_eq!(device.as_deref(), Some("/dev/vdb"));
    assert_eq!(h.volumes.volume(&volume_id).unwrap().status, VolumeStatus::Attaching);
    let bdms = h.api.resolver().get_bdms(&instance.uuid).unwrap();
    assert!(bdms.iter().any(|bdm| bdm.volume_id.as_ref() == Some(&volume_id)));
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["attach_volume"]);
}

#[test]
fn failed_attach_leaves_no_device_behind() {
    let h = Harness::new();
    let instance = h.boot_active();
    let before = h.api.resolver().get_bdms(&instance.uuid).unwrap().len();

    let err = h.api.attach_volume(&h.ctx(), &instance.uuid, &VolumeId::new("missing"), None).unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(h.api.resolver().get_bdms(&instance.uuid).unwrap().len(), before);
    assert!(h.rpc.orders().is_empty());
}

#[test]
fn attach_rejects_a_malformed_device_path() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.volumes.add_volume(Volume::available("vol-data", 5));

    let err = h.api.attach_volume(&h.ctx(), &instance.uuid, &VolumeId::new("vol-data"), Some("sdb")).unwrap_err();
    assert!(matches!(err, Error::InvalidDevicePath(_)));
}

#[test]
fn attach_to_shelved_offloaded_instance_needs_no_host() {
    let h = Harness::new();
    let instance = h.boot_active();
    h.set_states(&instance.uuid, VmState::ShelvedOffloaded, None);
    h.volumes.add_volume(Volume::available("vol-data", 5));
    let volume_id = VolumeId::new("vol-data");

    let device = h.api.attach_volume(&h.ctx(), &instance.uuid, &volume_id, None).unwrap();

    assert!(device.is_none());
    assert_eq!(h.volumes.volume(&volume_id).unwrap().status, VolumeStatus::InUse);
    assert!(h.rpc.orders().is_empty());
}

#[test]
fn detach_and_swap_volume() {
    let h = Harness::new();
    let instance = h.boot_active();
    let old_volume = VolumeId::new("vol-old");
    h.volumes.add_volume(Volume::available("vol-old", 5));
    h.volumes.attach(&h.ctx(), &old_volume, &instance.uuid, "/dev/vdb").unwrap();
    h.volumes.add_volume(Volume::available("vol-small", 1));
    h.volumes.add_volume(Volume::available("vol-new", 10));

    let err = h.api.swap_volume(&h.ctx(), &instance.uuid, &old_volume, &VolumeId::new("vol-small")).unwrap_err();
    assert!(matches!(err, Error::InvalidVolume(_)));

    h.api.swap_volume(&h.ctx(), &instance.uuid, &old_volume, &VolumeId::new("vol-new")).unwrap();
    assert_eq!(h.volumes.volume(&old_volume).unwrap().status, VolumeStatus::Detaching);
    assert_eq!(h.volumes.volume(&VolumeId::new("vol-new")).unwrap().status, VolumeStatus::Attaching);

    h.volumes.roll_detaching(&h.ctx(), &old_volume).unwrap();
    h.api.detach_volume(&h.ctx(), &instance.uuid, &old_volume).unwrap();
    assert_eq!(h.volumes.volume(&old_volume).unwrap().status, VolumeStatus::Detaching);
    assert_eq!(h.rpc.verbs_for(&instance.uuid), vec!["swap_volume", "detach_volume"]);
}

//---------------------
// --- Metadata ---

#[test]
fn metadata_updates_send_only_the_diff() {
    let h = Harness::new();
    let instance = h.boot_active();

    let merged = h
        .api
        .update_instance_metadata(&h.ctx(), &instance.uuid, BTreeMap::from([("a".to_string(), "1".to_string())]), false)
        .unwrap();
    assert_eq!(merged.get("a").map(String::as_str), Some("1"));

    let replaced = h
        .api
        .update_instance_metadata(&h.ctx(), &instance.uuid, BTreeMap::from([("b".to_string(), "2".to_string())]), true)
        .unwrap();
    assert!(!replaced.contains_key("a"));

    let Some(HostWorkOrder::ChangeInstanceMetadata { diff }) = h.rpc.orders().pop().map(|o| o.order) else {
        panic!("no metadata order dispatched");
    };
    assert_eq!(diff.get("a"), Some(&MetadataChange::Delete));
    assert_eq!(diff.get("b"), Some(&MetadataChange::Set("2".to_string())));

    h.api.delete_instance_metadata(&h.ctx(), &instance.uuid, "b").unwrap();
    let record = h.api.resolver().get_instance(&instance.uuid).unwrap();
    assert!(record.metadata.is_empty());
    assert_eq!(h.rpc.verbs_for(&instance.uuid).len(), 3);
}

#[test]
fn metadata_update_is_bounded_by_quota() {
    let h = Harness::new();
    let instance = h.boot_active();
    let metadata: BTreeMap<String, String> = (0..129).map(|i| (format!("k{}", i), "v".to_string())).collect();

    let err = h.api.update_instance_metadata(&h.ctx(), &instance.uuid, metadata, false).unwrap_err();

    assert!(matches!(err, Error::MetadataLimitExceeded { allowed: 128 }));
    assert!(h.rpc.orders().is_empty());
}

use serde_json::Value;
use std::collections::BTreeMap;

use crate::api::block_device_dto::BlockDeviceDto;
use crate::domain::block_device::mapping::{SourceType, is_volume_backed, root_bdm};
use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::creation::{check_auto_disk_config, inherit_properties_from_image, system_metadata_from_image};
use crate::domain::compute::delete::SHELVED_IMAGE_ID;
use crate::domain::compute::guard::{self, check_instance_lock};
use crate::domain::compute::notifications::{InstanceAction, record_action_start};
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::{Instance, LockedBy};
use crate::domain::instance::vm_state::TaskState;
use crate::domain::services::compute_rpc::HostWorkOrder;
use crate::domain::services::conductor::ConductorTask;
use crate::domain::services::image::ImageMeta;
use crate::domain::utils::id::{ImageId, InstanceId};
use crate::error::{Error, Result};

const IMAGE_PROPERTY_PREFIX: &str = "image_";
/// Properties that never carry over from an instance into its snapshots.
const NON_INHERITABLE_IMAGE_PROPERTIES: [&str; 3] = ["cache_in_nova", "bittorrent", "img_signature"];

/// Parameters of a rebuild onto a (possibly different) image.
#[derive(Debug, Clone, Default)]
pub struct RebuildRequest {
    pub image_href: Option<ImageId>,
    pub admin_password: Option<String>,
    pub injected_files: Vec<(String, String)>,
    /// Replaces the instance metadata when given.
    pub metadata: Option<BTreeMap<String, String>>,
    pub preserve_ephemeral: bool,
    pub auto_disk_config: Option<bool>,
}

impl ComputeApi {
    //---------------------
    // --- Rebuild ---

    /// Re-runs the creation checks against the new image before handing the
    /// rebuild to the conductor.
    pub fn rebuild(&self, ctx: &RequestContext, instance_uuid: &InstanceId, request: RebuildRequest) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::REBUILD.check(&instance)?;

        let orig_image_ref = instance.image_ref.clone();
        let image_id = request.image_href.clone().or_else(|| orig_image_ref.clone());
        let image = match &image_id {
            Some(image_id) => self.services.image_service.get(ctx, image_id)?,
            None => ImageMeta::default(),
        };
        check_auto_disk_config(&image, request.auto_disk_config)?;

        let bdms = self.resolver.get_bdms(&instance.uuid)?;
        let metadata = request.metadata.clone().unwrap_or_else(|| instance.metadata.clone());
        self.checks_for_create_and_rebuild(
            ctx,
            image_id.as_ref(),
            &image,
            &instance.flavor,
            &metadata,
            &request.injected_files,
            root_bdm(&bdms),
        )?;

        let (kernel_id, ramdisk_id) = self.handle_kernel_and_ramdisk(ctx, None, None, &image)?;

        inherit_properties_from_image(&mut instance, &image, request.auto_disk_config);
        instance.image_ref = image_id.clone();
        instance.kernel_id = kernel_id;
        instance.ramdisk_id = ramdisk_id;
        instance.progress = 0;
        instance.metadata = metadata;
        self.set_task_state(ctx, &mut instance, Some(TaskState::Rebuilding), &[None])?;

        let orig_sys_metadata = instance.system_metadata.clone();
        instance.system_metadata.retain(|key, _| !key.starts_with(IMAGE_PROPERTY_PREFIX));
        instance.system_metadata.extend(system_metadata_from_image(&image));
        instance = self.resolver.save_instance(&instance, None)?;

        record_action_start(ctx, &instance, InstanceAction::Rebuild);
        self.services.compute_task_api.submit(
            ctx,
            ConductorTask::RebuildInstance {
                instance: instance.clone(),
                orig_image_ref,
                image_ref: image_id,
                new_pass: request.admin_password,
                injected_files: request.injected_files,
                orig_sys_metadata,
                preserve_ephemeral: request.preserve_ephemeral,
                recreate: false,
                on_shared_storage: false,
                host: instance.host.clone(),
                requested_destination: None,
            },
        )?;
        Ok(instance)
    }

    //---------------------
    // --- Rescue ---

    pub fn rescue(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        rescue_password: Option<String>,
        rescue_image_ref: Option<ImageId>,
        clean_shutdown: bool,
    ) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::RESCUE.check(&instance)?;

        let bdms = self.resolver.get_bdms(&instance.uuid)?;
        for volume_id in bdms.iter().filter_map(|bdm| bdm.volume_id.as_ref()) {
            let volume = self.services.volume_service.get(ctx, volume_id)?;
            if volume.attachment_for(&instance.uuid).is_none() {
                return Err(Error::InvalidVolume(format!("volume {} is not attached to {}", volume_id, instance.uuid)));
            }
        }
        if is_volume_backed(instance.image_ref.as_ref(), &bdms) {
            return Err(Error::InstanceNotRescuable {
                instance_id: instance.uuid.clone(),
                reason: "Cannot rescue a volume-backed instance".to_string(),
            });
        }

        self.set_task_state(ctx, &mut instance, Some(TaskState::Rescuing), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Rescue);
        self.cast_to_host(ctx, &instance, HostWorkOrder::RescueInstance { rescue_password, rescue_image_ref, clean_shutdown })?;
        Ok(instance)
    }

    pub fn unrescue(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::UNRESCUE.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(TaskState::Unrescuing), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Unrescue);
        self.cast_to_host(ctx, &instance, HostWorkOrder::UnrescueInstance)?;
        Ok(instance)
    }

    //---------------------
    // --- Shelve ---

    /// Image-backed instances are snapshotted first; volume-backed ones are
    /// offloaded straight away since their disks already live elsewhere.
    pub fn shelve(&self, ctx: &RequestContext, instance_uuid: &InstanceId, clean_shutdown: bool) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::SHELVE.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(TaskState::Shelving), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Shelve);

        let bdms = self.resolver.get_bdms(&instance.uuid)?;
        if is_volume_backed(instance.image_ref.as_ref(), &bdms) {
            self.cast_to_host(ctx, &instance, HostWorkOrder::ShelveOffloadInstance { clean_shutdown })?;
            return Ok(instance);
        }

        let name = format!("{}-shelved", instance.display_name);
        let image_id = self.create_image(ctx, &instance, &name, "snapshot", BTreeMap::new())?;
        instance.system_metadata.insert(SHELVED_IMAGE_ID.to_string(), image_id.to_string());
        instance = self.resolver.save_instance(&instance, None)?;
        self.cast_to_host(ctx, &instance, HostWorkOrder::ShelveInstance { image_id, clean_shutdown })?;
        Ok(instance)
    }

    pub fn shelve_offload(&self, ctx: &RequestContext, instance_uuid: &InstanceId, clean_shutdown: bool) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::SHELVE_OFFLOAD.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(TaskState::ShelvingOffloading), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::ShelveOffload);
        self.cast_to_host(ctx, &instance, HostWorkOrder::ShelveOffloadInstance { clean_shutdown })?;
        Ok(instance)
    }

    /// Offloaded instances need a new host, so unshelving goes through the
    /// conductor rather than a host worker.
    pub fn unshelve(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::UNSHELVE.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(TaskState::Unshelving), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::Unshelve);
        self.services.compute_task_api.submit(ctx, ConductorTask::UnshelveInstance { instance: instance.clone() })?;
        Ok(instance)
    }

    //---------------------
    // --- Password, snapshots, backups ---

    pub fn set_admin_password(&self, ctx: &RequestContext, instance_uuid: &InstanceId, new_pass: String) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::SET_ADMIN_PASSWORD.check(&instance)?;

        self.set_task_state(ctx, &mut instance, Some(TaskState::UpdatingPassword), &[None])?;
        record_action_start(ctx, &instance, InstanceAction::ChangePassword);
        self.cast_to_host(ctx, &instance, HostWorkOrder::SetAdminPassword { new_pass })?;
        Ok(instance)
    }

    /// Snapshots are not blocked by the instance lock.
    pub fn snapshot(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        name: &str,
        extra_properties: BTreeMap<String, String>,
    ) -> Result<ImageId> {
        let mut instance = self.get(ctx, instance_uuid)?;
        guard::SNAPSHOT.check(&instance)?;

        let image_id = self.create_image(ctx, &instance, name, "snapshot", extra_properties)?;
        self.set_task_state(ctx, &mut instance, Some(TaskState::ImageSnapshotPending), &[None])?;
        self.cast_to_host(ctx, &instance, HostWorkOrder::SnapshotInstance { image_id: image_id.clone() })?;
        Ok(image_id)
    }

    pub fn backup(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        name: &str,
        backup_type: &str,
        rotation: u32,
        mut extra_properties: BTreeMap<String, String>,
    ) -> Result<ImageId> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::BACKUP.check(&instance)?;

        let bdms = self.resolver.get_bdms(&instance.uuid)?;
        if is_volume_backed(instance.image_ref.as_ref(), &bdms) {
            log::info!("ComputeApi {}: backup of a volume backed instance is not supported", instance.uuid);
            return Err(Error::InvalidRequest("Backup of a volume backed instance is not supported".to_string()));
        }

        extra_properties.insert("backup_type".to_string(), backup_type.to_string());
        let image_id = self.create_image(ctx, &instance, name, "backup", extra_properties)?;
        self.set_task_state(ctx, &mut instance, Some(TaskState::ImageBackup), &[None])?;
        self.cast_to_host(
            ctx,
            &instance,
            HostWorkOrder::BackupInstance { image_id: image_id.clone(), backup_type: backup_type.to_string(), rotation },
        )?;
        Ok(image_id)
    }

    /// Snapshots every attached volume and registers an image that only
    /// carries the resulting device mapping.
    pub fn snapshot_volume_backed(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        name: &str,
        extra_properties: BTreeMap<String, String>,
    ) -> Result<ImageMeta> {
        let instance = self.get(ctx, instance_uuid)?;
        guard::SNAPSHOT_VOLUME_BACKED.check(&instance)?;

        let mut image_meta = snapshot_image_meta(&instance, name, extra_properties);
        image_meta.size = 0;
        for key in ["block_device_mapping", "bdm_v2", "root_device_name"] {
            image_meta.properties.remove(key);
        }
        if let Some(root_device_name) = &instance.root_device_name {
            image_meta.properties.insert("root_device_name".to_string(), Value::String(root_device_name.clone()));
        }

        let mut mapping = Vec::new();
        for bdm in self.resolver.get_bdms(&instance.uuid)?.into_iter().filter(|bdm| !bdm.no_device) {
            let mut entry = bdm.clone();
            if let (true, Some(volume_id)) = (bdm.is_volume(), bdm.volume_id.as_ref()) {
                let volume = self.services.volume_service.get(ctx, volume_id)?;
                log::debug!("ComputeApi {}: creating snapshot from volume {}", instance.uuid, volume.id);
                let snapshot_name = format!("snapshot for {}", name);
                let snapshot = self.services.volume_service.create_snapshot_force(ctx, &volume.id, &snapshot_name, "")?;
                entry.source_type = SourceType::Snapshot;
                entry.snapshot_id = Some(snapshot.id);
                entry.volume_id = None;
                entry.volume_size = Some(snapshot.size);
            }
            entry.instance_uuid = None;
            entry.connection_info = None;
            mapping.push(entry);
        }

        if !mapping.is_empty() {
            let dtos: Vec<BlockDeviceDto> = mapping.iter().map(Into::into).collect();
            image_meta.properties.insert("block_device_mapping".to_string(), serde_json::to_value(dtos)?);
            image_meta.properties.insert("bdm_v2".to_string(), Value::Bool(true));
        }

        self.services.image_service.create(ctx, image_meta)
    }

    fn create_image(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        name: &str,
        image_type: &str,
        extra_properties: BTreeMap<String, String>,
    ) -> Result<ImageId> {
        let mut properties = BTreeMap::from([
            ("instance_uuid".to_string(), instance.uuid.to_string()),
            ("user_id".to_string(), ctx.user_id.to_string()),
            ("image_type".to_string(), image_type.to_string()),
        ]);
        properties.extend(extra_properties);

        let mut image_meta = snapshot_image_meta(instance, name, properties);
        if image_type == "snapshot" {
            image_meta.properties.remove("disk_format");
            image_meta.properties.remove("container_format");
        }
        let created = self.services.image_service.create(ctx, image_meta)?;
        created.id.ok_or_else(|| Error::external("image", name, "created image has no id"))
    }

    //---------------------
    // --- Locking ---

    /// Owners relocking their own instance is a no-op; anyone else locks
    /// as admin.
    pub fn lock(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        let is_owner = instance.project_id == ctx.project_id;
        if instance.locked && is_owner {
            return Ok(instance);
        }

        log::debug!("ComputeApi {}: locking", instance.uuid);
        instance.locked = true;
        instance.locked_by = Some(if is_owner { LockedBy::Owner } else { LockedBy::Admin });
        instance = self.resolver.save_instance(&instance, None)?;
        record_action_start(ctx, &instance, InstanceAction::Lock);
        Ok(instance)
    }

    /// Whether the caller is the party the current lock is attributed to.
    pub fn is_expected_locked_by(&self, ctx: &RequestContext, instance: &Instance) -> bool {
        let expected = if instance.project_id == ctx.project_id { LockedBy::Owner } else { LockedBy::Admin };
        instance.locked_by.is_none_or(|locked_by| locked_by == expected)
    }

    /// Non-admin callers cannot lift a lock placed by an admin.
    pub fn unlock(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let mut instance = self.get(ctx, instance_uuid)?;
        if !ctx.is_admin && !self.is_expected_locked_by(ctx, &instance) {
            return Err(Error::InstanceLocked(instance.uuid.clone()));
        }

        log::debug!("ComputeApi {}: unlocking", instance.uuid);
        instance.locked = false;
        instance.locked_by = None;
        instance = self.resolver.save_instance(&instance, None)?;
        record_action_start(ctx, &instance, InstanceAction::Unlock);
        Ok(instance)
    }
}

/// Image metadata for a snapshot of `instance`, rebuilt from the image
/// properties kept in its system metadata.
fn snapshot_image_meta(instance: &Instance, name: &str, extra_properties: BTreeMap<String, String>) -> ImageMeta {
    let mut image_meta = ImageMeta { name: Some(name.to_string()), ..Default::default() };
    for (key, value) in &instance.system_metadata {
        let Some(property) = key.strip_prefix(IMAGE_PROPERTY_PREFIX) else {
            continue;
        };
        match property {
            "min_ram" => image_meta.min_ram = value.parse().unwrap_or(0),
            "min_disk" => image_meta.min_disk = value.parse().unwrap_or(0),
            "base_image_ref" => {}
            _ if NON_INHERITABLE_IMAGE_PROPERTIES.contains(&property) => {}
            _ => {
                image_meta.properties.insert(property.to_string(), Value::String(value.clone()));
            }
        }
    }
    for (key, value) in extra_properties {
        image_meta.properties.insert(key, Value::String(value));
    }
    image_meta
}

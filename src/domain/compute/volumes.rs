use crate::domain::block_device::mapping::{BlockDeviceMapping, match_device};
use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::guard::{self, check_instance_host, check_instance_lock};
use crate::domain::compute::notifications::{InstanceAction, record_action_start};
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::VmState;
use crate::domain::services::compute_rpc::HostWorkOrder;
use crate::domain::services::volume::AttachStatus;
use crate::domain::utils::id::{InstanceId, NetworkId, PortId, VolumeId};
use crate::error::{Error, Result};

impl ComputeApi {
    //---------------------
    // --- Volumes ---

    /// Attaches an existing volume and returns the device name it got.
    ///
    /// A shelved-offloaded instance has no host to ask for a device name, so
    /// the volume is marked in use right away and the host attaches it on
    /// unshelve.
    pub fn attach_volume(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        volume_id: &VolumeId,
        device: Option<&str>,
    ) -> Result<Option<String>> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::ATTACH_VOLUME.check(&instance)?;

        if let Some(device) = device {
            if !match_device(device) {
                return Err(Error::InvalidDevicePath(device.to_string()));
            }
        }

        if instance.vm_state == VmState::ShelvedOffloaded {
            return self.attach_volume_shelved_offloaded(ctx, &instance, volume_id, device);
        }

        let host = check_instance_host(&instance)?;
        let device_name = self.services.compute_rpc.reserve_block_device_name(ctx, host, &instance, device, volume_id)?;
        let bdm = BlockDeviceMapping::volume(volume_id.clone()).with_device_name(device_name.clone());
        let database = self.resolver.database_for(&instance.uuid)?;
        database.create_bdm(&instance.uuid, bdm.clone());

        let attached = self.check_attach_and_reserve_volume(ctx, volume_id).and_then(|()| {
            record_action_start(ctx, &instance, InstanceAction::AttachVolume);
            self.cast_to_host(ctx, &instance, HostWorkOrder::AttachVolume { bdm })
        });
        if let Err(e) = attached {
            if let Err(cleanup) = database.destroy_bdm_by_volume(&instance.uuid, volume_id) {
                log::debug!("ComputeApi {}: block device of volume {} already gone: {}", instance.uuid, volume_id, cleanup);
            }
            return Err(e);
        }
        Ok(Some(device_name))
    }

    fn attach_volume_shelved_offloaded(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        volume_id: &VolumeId,
        device: Option<&str>,
    ) -> Result<Option<String>> {
        let database = self.resolver.database_for(&instance.uuid)?;
        database.create_bdm(&instance.uuid, BlockDeviceMapping::volume(volume_id.clone()));

        let attached = self.check_attach_and_reserve_volume(ctx, volume_id).and_then(|()| {
            self.services.volume_service.attach(ctx, volume_id, &instance.uuid, device.unwrap_or_default())
        });
        if let Err(e) = attached {
            if let Err(cleanup) = database.destroy_bdm_by_volume(&instance.uuid, volume_id) {
                log::debug!("ComputeApi {}: block device of volume {} already gone: {}", instance.uuid, volume_id, cleanup);
            }
            return Err(e);
        }
        log::info!("ComputeApi {}: volume {} attached while shelved offloaded", instance.uuid, volume_id);
        Ok(None)
    }

    fn check_attach_and_reserve_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        let volume = self.services.volume_service.get(ctx, volume_id)?;
        self.services.volume_service.check_attach(ctx, &volume)?;
        self.services.volume_service.reserve_volume(ctx, volume_id)
    }

    pub fn detach_volume(&self, ctx: &RequestContext, instance_uuid: &InstanceId, volume_id: &VolumeId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::DETACH_VOLUME.check(&instance)?;

        let volume = self.services.volume_service.get(ctx, volume_id)?;
        self.services.volume_service.check_detach(ctx, &volume, Some(&instance.uuid))?;
        self.services.volume_service.begin_detaching(ctx, volume_id)?;

        if instance.vm_state == VmState::ShelvedOffloaded {
            let database = self.resolver.database_for(&instance.uuid)?;
            let bdm = database.get_bdm_by_volume(&instance.uuid, volume_id)?;
            self.local_cleanup_bdm_volumes(ctx, &instance, std::slice::from_ref(&bdm));
            return database.destroy_bdm_by_volume(&instance.uuid, volume_id);
        }

        let attachment_id = volume.attachment_for(&instance.uuid).map(|a| a.attachment_id.clone());
        record_action_start(ctx, &instance, InstanceAction::DetachVolume);
        self.cast_to_host(ctx, &instance, HostWorkOrder::DetachVolume { volume_id: volume_id.clone(), attachment_id })
    }

    /// Replaces an attached volume with an unattached one of at least the
    /// same size. Both volumes are put back when the host cannot be told.
    pub fn swap_volume(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        old_volume_id: &VolumeId,
        new_volume_id: &VolumeId,
    ) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::SWAP_VOLUME.check(&instance)?;

        let volume_service = &self.services.volume_service;
        let old_volume = volume_service.get(ctx, old_volume_id)?;
        let new_volume = volume_service.get(ctx, new_volume_id)?;

        if old_volume.attach_status == AttachStatus::Detached {
            return Err(Error::InvalidVolume(format!("volume {} is not attached to anything", old_volume_id)));
        }
        if old_volume.attachment_for(&instance.uuid).is_none() {
            return Err(Error::InvalidVolume("Old volume is attached to a different instance.".to_string()));
        }
        if new_volume.attach_status == AttachStatus::Attached {
            return Err(Error::InvalidVolume("New volume must be detached in order to swap.".to_string()));
        }
        if new_volume.size < old_volume.size {
            return Err(Error::InvalidVolume("New volume must be the same size or larger.".to_string()));
        }
        volume_service.check_detach(ctx, &old_volume, None)?;
        volume_service.check_attach(ctx, &new_volume)?;

        volume_service.begin_detaching(ctx, old_volume_id)?;
        if let Err(e) = volume_service.reserve_volume(ctx, new_volume_id) {
            self.roll_back_swap(ctx, &instance, old_volume_id, None);
            return Err(e);
        }

        record_action_start(ctx, &instance, InstanceAction::SwapVolume);
        let order = HostWorkOrder::SwapVolume { old_volume_id: old_volume_id.clone(), new_volume_id: new_volume_id.clone() };
        if let Err(e) = self.cast_to_host(ctx, &instance, order) {
            self.roll_back_swap(ctx, &instance, old_volume_id, Some(new_volume_id));
            return Err(e);
        }
        Ok(())
    }

    fn roll_back_swap(&self, ctx: &RequestContext, instance: &Instance, old_volume_id: &VolumeId, new_volume_id: Option<&VolumeId>) {
        if let Err(e) = self.services.volume_service.roll_detaching(ctx, old_volume_id) {
            log::warn!("ComputeApi {}: failed to roll back detaching of {}: {}", instance.uuid, old_volume_id, e);
        }
        if let Some(new_volume_id) = new_volume_id {
            if let Err(e) = self.services.volume_service.unreserve_volume(ctx, new_volume_id) {
                log::warn!("ComputeApi {}: failed to unreserve {}: {}", instance.uuid, new_volume_id, e);
            }
        }
    }

    //---------------------
    // --- Interfaces ---

    pub fn attach_interface(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        network_id: Option<NetworkId>,
        port_id: Option<PortId>,
        requested_ip: Option<String>,
    ) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::ATTACH_INTERFACE.check(&instance)?;

        record_action_start(ctx, &instance, InstanceAction::AttachInterface);
        self.cast_to_host(ctx, &instance, HostWorkOrder::AttachInterface { network_id, port_id, requested_ip })
    }

    pub fn detach_interface(&self, ctx: &RequestContext, instance_uuid: &InstanceId, port_id: PortId) -> Result<()> {
        let instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::DETACH_INTERFACE.check(&instance)?;

        record_action_start(ctx, &instance, InstanceAction::DetachInterface);
        self.cast_to_host(ctx, &instance, HostWorkOrder::DetachInterface { port_id })
    }
}

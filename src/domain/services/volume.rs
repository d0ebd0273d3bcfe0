use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use crate::domain::context::RequestContext;
use crate::domain::utils::id::{AttachmentId, InstanceId, SnapshotId, VolumeId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Available,
    Attaching,
    InUse,
    Detaching,
    Error,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStatus::Available => "available",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Attached,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub attachment_id: AttachmentId,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub id: VolumeId,
    /// Size in GiB.
    pub size: i64,
    pub status: VolumeStatus,
    pub attach_status: AttachStatus,
    pub bootable: bool,
    pub availability_zone: Option<String>,
    pub attachments: BTreeMap<InstanceId, VolumeAttachment>,
    pub volume_image_metadata: BTreeMap<String, String>,
}

impl Volume {
    pub fn available(id: impl Into<String>, size: i64) -> Self {
        Self {
            id: VolumeId::new(id),
            size,
            status: VolumeStatus::Available,
            attach_status: AttachStatus::Detached,
            bootable: false,
            availability_zone: None,
            attachments: BTreeMap::new(),
            volume_image_metadata: BTreeMap::new(),
        }
    }

    pub fn bootable(mut self) -> Self {
        self.bootable = true;
        self
    }

    pub fn attachment_for(&self, instance_uuid: &InstanceId) -> Option<&VolumeAttachment> {
        self.attachments.get(instance_uuid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub size: i64,
    pub display_name: String,
}

/// Block storage collaborator.
pub trait VolumeService: Debug + Send + Sync {
    fn get(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<Volume>;

    fn get_snapshot(&self, ctx: &RequestContext, snapshot_id: &SnapshotId) -> Result<Snapshot>;

    /// A volume can be attached when it is available and not attached yet.
    fn check_attach(&self, _ctx: &RequestContext, volume: &Volume) -> Result<()> {
        if volume.status != VolumeStatus::Available {
            return Err(Error::InvalidVolume(format!(
                "volume '{}' status must be 'available'. Currently in '{}'",
                volume.id, volume.status
            )));
        }
        if volume.attach_status == AttachStatus::Attached {
            return Err(Error::InvalidVolume(format!("volume {} already attached", volume.id)));
        }
        Ok(())
    }

    /// A volume can be detached from `instance_uuid` only while attached to it.
    fn check_detach(&self, _ctx: &RequestContext, volume: &Volume, instance_uuid: Option<&InstanceId>) -> Result<()> {
        if volume.status == VolumeStatus::Available {
            return Err(Error::InvalidVolume(format!("volume {} already detached", volume.id)));
        }
        if let Some(instance_uuid) = instance_uuid {
            if volume.attachment_for(instance_uuid).is_none() {
                return Err(Error::InvalidVolume(format!("volume {} is not attached to {}", volume.id, instance_uuid)));
            }
        }
        Ok(())
    }

    fn reserve_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()>;

    fn unreserve_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()>;

    fn begin_detaching(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()>;

    fn roll_detaching(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()>;

    fn attach(&self, ctx: &RequestContext, volume_id: &VolumeId, instance_uuid: &InstanceId, mountpoint: &str) -> Result<()>;

    fn detach(
        &self,
        ctx: &RequestContext,
        volume_id: &VolumeId,
        instance_uuid: &InstanceId,
        attachment_id: Option<&AttachmentId>,
    ) -> Result<()>;

    fn terminate_connection(&self, ctx: &RequestContext, volume_id: &VolumeId, connector_host: &str) -> Result<()>;

    fn create_snapshot_force(
        &self,
        ctx: &RequestContext,
        volume_id: &VolumeId,
        name: &str,
        description: &str,
    ) -> Result<Snapshot>;

    fn delete(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()>;
}

#[derive(Debug, Default)]
struct VolumeStoreInner {
    volumes: HashMap<VolumeId, Volume>,
    snapshots: HashMap<SnapshotId, Snapshot>,
    terminated_connections: Vec<(VolumeId, String)>,
}

/// Volume service held in process memory, mirroring the status transitions
/// of a real block storage backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVolumeService {
    inner: Arc<RwLock<VolumeStoreInner>>,
}

impl InMemoryVolumeService {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, VolumeStoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_volume(&self, volume: Volume) {
        self.write().volumes.insert(volume.id.clone(), volume);
    }

    pub fn add_snapshot(&self, snapshot: Snapshot) {
        self.write().snapshots.insert(snapshot.id.clone(), snapshot);
    }

    pub fn volume(&self, volume_id: &VolumeId) -> Option<Volume> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).volumes.get(volume_id).cloned()
    }

    pub fn terminated_connections(&self) -> Vec<(VolumeId, String)> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).terminated_connections.clone()
    }

    fn update<F>(&self, volume_id: &VolumeId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Volume),
    {
        let mut guard = self.write();
        let volume = guard.volumes.get_mut(volume_id).ok_or_else(|| Error::not_found("Volume", volume_id))?;
        f(volume);
        Ok(())
    }
}

impl VolumeService for InMemoryVolumeService {
    fn get(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<Volume> {
        self.volume(volume_id).ok_or_else(|| Error::not_found("Volume", volume_id))
    }

    fn get_snapshot(&self, _ctx: &RequestContext, snapshot_id: &SnapshotId) -> Result<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Snapshot", snapshot_id))
    }

    fn reserve_volume(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.update(volume_id, |v| v.status = VolumeStatus::Attaching)
    }

    fn unreserve_volume(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.update(volume_id, |v| {
            if v.status == VolumeStatus::Attaching {
                v.status = VolumeStatus::Available;
            }
        })
    }

    fn begin_detaching(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        let mut guard = self.write();
        let volume = guard.volumes.get_mut(volume_id).ok_or_else(|| Error::not_found("Volume", volume_id))?;
        if volume.status != VolumeStatus::InUse {
            return Err(Error::InvalidVolume(format!("volume {} must be in-use to begin detaching", volume_id)));
        }
        volume.status = VolumeStatus::Detaching;
        Ok(())
    }

    fn roll_detaching(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.update(volume_id, |v| {
            if v.status == VolumeStatus::Detaching {
                v.status = VolumeStatus::InUse;
            }
        })
    }

    fn attach(&self, _ctx: &RequestContext, volume_id: &VolumeId, instance_uuid: &InstanceId, mountpoint: &str) -> Result<()> {
        self.update(volume_id, |v| {
            v.status = VolumeStatus::InUse;
            v.attach_status = AttachStatus::Attached;
            v.attachments.insert(
                instance_uuid.clone(),
                VolumeAttachment { attachment_id: AttachmentId::generate(), mountpoint: mountpoint.to_string() },
            );
        })
    }

    fn detach(
        &self,
        _ctx: &RequestContext,
        volume_id: &VolumeId,
        instance_uuid: &InstanceId,
        _attachment_id: Option<&AttachmentId>,
    ) -> Result<()> {
        self.update(volume_id, |v| {
            v.attachments.remove(instance_uuid);
            if v.attachments.is_empty() {
                v.status = VolumeStatus::Available;
                v.attach_status = AttachStatus::Detached;
            }
        })
    }

    fn terminate_connection(&self, _ctx: &RequestContext, volume_id: &VolumeId, connector_host: &str) -> Result<()> {
        let mut guard = self.write();
        if !guard.volumes.contains_key(volume_id) {
            return Err(Error::not_found("Volume", volume_id));
        }
        guard.terminated_connections.push((volume_id.clone(), connector_host.to_string()));
        Ok(())
    }

    fn create_snapshot_force(
        &self,
        _ctx: &RequestContext,
        volume_id: &VolumeId,
        name: &str,
        _description: &str,
    ) -> Result<Snapshot> {
        let mut guard = self.write();
        let size = guard.volumes.get(volume_id).map(|v| v.size).ok_or_else(|| Error::not_found("Volume", volume_id))?;
        let snapshot =
            Snapshot { id: SnapshotId::generate(), volume_id: volume_id.clone(), size, display_name: name.to_string() };
        guard.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    fn delete(&self, _ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        let mut guard = self.write();
        match guard.volumes.get(volume_id) {
            None => Err(Error::not_found("Volume", volume_id)),
            Some(v) if v.attach_status == AttachStatus::Attached => {
                Err(Error::InvalidVolume(format!("volume {} is still attached", volume_id)))
            }
            Some(_) => {
                guard.volumes.remove(volume_id);
                Ok(())
            }
        }
    }
}

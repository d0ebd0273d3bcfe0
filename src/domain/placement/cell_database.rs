use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::migration::{Migration, MigrationId, MigrationStatus};
use crate::domain::instance::vm_state::{TaskState, task_state_str};
use crate::domain::utils::id::{CellId, InstanceId, VolumeId};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct CellInner {
    instances: HashMap<InstanceId, Instance>,

    /// Block devices per instance, in persistence order.
    bdms: HashMap<InstanceId, Vec<BlockDeviceMapping>>,

    migrations: SlotMap<MigrationId, Migration>,
}

/// Durable records owned by one cell: instances, their block devices and
/// their migrations.
///
/// Instance saves are optimistic: a save names the task states it expects
/// the stored record to be in and is rejected when another writer got there
/// first.
#[derive(Debug, Clone)]
pub struct CellDatabase {
    cell_id: CellId,
    inner: Arc<RwLock<CellInner>>,
}

pub(crate) fn render_expected(expected: &[Option<TaskState>]) -> String {
    let names: Vec<&str> = expected.iter().map(|t| task_state_str(*t)).collect();
    format!("[{}]", names.join(", "))
}

impl CellDatabase {
    pub fn new(cell_id: CellId) -> Self {
        Self { cell_id, inner: Arc::new(RwLock::new(CellInner::default())) }
    }

    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    fn read(&self) -> RwLockReadGuard<'_, CellInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CellInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    //---------------------
    // --- Instances ---

    pub fn create_instance(&self, instance: &Instance) -> Result<()> {
        let mut guard = self.write();
        if guard.instances.contains_key(&instance.uuid) {
            return Err(Error::InstanceExists(instance.uuid.clone()));
        }
        guard.instances.insert(instance.uuid.clone(), instance.clone());
        log::debug!("CellDatabase {}: created instance {}", self.cell_id, instance.uuid);
        Ok(())
    }

    pub fn get_instance(&self, instance_uuid: &InstanceId) -> Result<Instance> {
        self.read().instances.get(instance_uuid).cloned().ok_or_else(|| Error::not_found("Instance", instance_uuid))
    }

    pub fn contains_instance(&self, instance_uuid: &InstanceId) -> bool {
        self.read().instances.contains_key(instance_uuid)
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.read().instances.values().cloned().collect()
    }

    /// Writes `instance` back.
    ///
    /// With `expected_task_state`, the stored task state must be one of the
    /// given values, otherwise nothing is written.
    ///
    /// # Errors
    /// `UnexpectedDeletingTaskState` when a concurrent delete got there first,
    /// `UnexpectedTaskState` for any other mismatch.
    pub fn save_instance(&self, instance: &Instance, expected_task_state: Option<&[Option<TaskState>]>) -> Result<Instance> {
        let mut guard = self.write();
        let stored = guard.instances.get_mut(&instance.uuid).ok_or_else(|| Error::not_found("Instance", &instance.uuid))?;

        if let Some(expected) = expected_task_state {
            if !expected.contains(&stored.task_state) {
                if stored.task_state == Some(TaskState::Deleting) {
                    return Err(Error::UnexpectedDeletingTaskState {
                        instance_id: instance.uuid.clone(),
                        expected: render_expected(expected),
                    });
                }
                return Err(Error::UnexpectedTaskState {
                    instance_id: instance.uuid.clone(),
                    expected: render_expected(expected),
                    actual: task_state_str(stored.task_state).to_string(),
                });
            }
        }

        *stored = instance.clone();
        Ok(stored.clone())
    }

    /// Removes the instance together with its block devices.
    pub fn destroy_instance(&self, instance_uuid: &InstanceId) -> Result<()> {
        let mut guard = self.write();
        guard.instances.remove(instance_uuid).ok_or_else(|| Error::not_found("Instance", instance_uuid))?;
        guard.bdms.remove(instance_uuid);
        log::debug!("CellDatabase {}: destroyed instance {}", self.cell_id, instance_uuid);
        Ok(())
    }

    //---------------------
    // --- Block devices ---

    pub fn create_bdm(&self, instance_uuid: &InstanceId, bdm: BlockDeviceMapping) {
        let bdm = BlockDeviceMapping { instance_uuid: Some(instance_uuid.clone()), ..bdm };
        self.write().bdms.entry(instance_uuid.clone()).or_default().push(bdm);
    }

    pub fn get_bdms(&self, instance_uuid: &InstanceId) -> Vec<BlockDeviceMapping> {
        self.read().bdms.get(instance_uuid).cloned().unwrap_or_default()
    }

    pub fn get_bdm_by_volume(&self, instance_uuid: &InstanceId, volume_id: &VolumeId) -> Result<BlockDeviceMapping> {
        self.read()
            .bdms
            .get(instance_uuid)
            .and_then(|bdms| bdms.iter().find(|bdm| bdm.volume_id.as_ref() == Some(volume_id)))
            .cloned()
            .ok_or_else(|| Error::not_found("Volume block device mapping", volume_id))
    }

    /// Replaces the device backed by `volume_id` with `bdm`.
    pub fn update_bdm_by_volume(&self, instance_uuid: &InstanceId, volume_id: &VolumeId, bdm: BlockDeviceMapping) -> Result<()> {
        let mut guard = self.write();
        let slot = guard
            .bdms
            .get_mut(instance_uuid)
            .and_then(|bdms| bdms.iter_mut().find(|b| b.volume_id.as_ref() == Some(volume_id)))
            .ok_or_else(|| Error::not_found("Volume block device mapping", volume_id))?;
        *slot = bdm;
        Ok(())
    }

    pub fn destroy_bdm_by_volume(&self, instance_uuid: &InstanceId, volume_id: &VolumeId) -> Result<()> {
        let mut guard = self.write();
        let bdms = guard.bdms.get_mut(instance_uuid).ok_or_else(|| Error::not_found("Volume block device mapping", volume_id))?;
        let before = bdms.len();
        bdms.retain(|bdm| bdm.volume_id.as_ref() != Some(volume_id));
        if bdms.len() == before {
            return Err(Error::not_found("Volume block device mapping", volume_id));
        }
        Ok(())
    }

    /// Moves all block devices of an instance out of this cell.
    pub fn take_bdms(&self, instance_uuid: &InstanceId) -> Vec<BlockDeviceMapping> {
        self.write().bdms.remove(instance_uuid).unwrap_or_default()
    }

    //---------------------
    // --- Migrations ---

    pub fn create_migration(&self, migration: Migration) -> MigrationId {
        let mut guard = self.write();
        log::debug!(
            "CellDatabase {}: created {:?} migration for instance {}",
            self.cell_id,
            migration.migration_type,
            migration.instance_uuid
        );
        guard.migrations.insert(migration)
    }

    pub fn get_migration(&self, migration_id: MigrationId) -> Result<Migration> {
        self.read().migrations.get(migration_id).cloned().ok_or_else(|| Error::not_found("Migration", format!("{:?}", migration_id)))
    }

    pub fn save_migration(&self, migration_id: MigrationId, migration: Migration) -> Result<()> {
        let mut guard = self.write();
        let slot = guard.migrations.get_mut(migration_id).ok_or_else(|| Error::not_found("Migration", format!("{:?}", migration_id)))?;
        *slot = migration;
        Ok(())
    }

    /// Most recent migration of the instance in the given status.
    pub fn get_migration_by_instance_and_status(
        &self,
        instance_uuid: &InstanceId,
        status: MigrationStatus,
    ) -> Result<(MigrationId, Migration)> {
        self.read()
            .migrations
            .iter()
            .filter(|(_, m)| &m.instance_uuid == instance_uuid && m.status == status)
            .max_by_key(|(_, m)| m.created_at)
            .map(|(id, m)| (id, m.clone()))
            .ok_or_else(|| Error::not_found("Migration", format!("{} with status {}", instance_uuid, status.as_str())))
    }

    pub fn migrations_in_progress(&self, instance_uuid: &InstanceId) -> Vec<(MigrationId, Migration)> {
        self.read()
            .migrations
            .iter()
            .filter(|(_, m)| &m.instance_uuid == instance_uuid && !m.status.is_terminal())
            .map(|(id, m)| (id, m.clone()))
            .collect()
    }
}

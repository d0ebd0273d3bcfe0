use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::{TaskState, task_state_str};
use crate::domain::placement::cell_database::{CellDatabase, render_expected};
use crate::domain::placement::placement_store::PlacementStore;
use crate::domain::utils::id::{CellId, HostName, InstanceId};
use crate::error::{Error, Result};

/// Locates instances whether or not they have been placed in a cell yet.
///
/// A mapping that names a cell is resolved in that cell. A pending mapping
/// is resolved through its build request; when the build request vanished
/// concurrently the mapping is read again, since the scheduler may have
/// placed the instance in between.
#[derive(Debug, Clone)]
pub struct CellAwareResolver {
    store: PlacementStore,
}

impl CellAwareResolver {
    pub fn new(store: PlacementStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PlacementStore {
        &self.store
    }

    /// Cell database holding the durable record of `instance_uuid`.
    pub fn database_for(&self, instance_uuid: &InstanceId) -> Result<CellDatabase> {
        match self.store.instance_mapping_or_none(instance_uuid).and_then(|m| m.cell_id) {
            Some(cell_id) => self.store.cell(&cell_id),
            None => Ok(self.store.default_cell().clone()),
        }
    }

    pub fn get_instance(&self, instance_uuid: &InstanceId) -> Result<Instance> {
        let Some(mapping) = self.store.instance_mapping_or_none(instance_uuid) else {
            return self.store.default_cell().get_instance(instance_uuid);
        };

        if let Some(cell_id) = &mapping.cell_id {
            return self.store.cell(cell_id)?.get_instance(instance_uuid);
        }

        match self.store.get_build_request(instance_uuid) {
            Ok(build_request) => Ok(build_request.instance),
            Err(e) if e.is_not_found() => {
                log::debug!("CellResolver: build request of {} vanished, re-reading its mapping", instance_uuid);
                self.database_for(instance_uuid)?.get_instance(instance_uuid)
            }
            Err(e) => Err(e),
        }
    }

    /// The durable record only; `None` when it is already gone.
    pub fn lookup_instance(&self, instance_uuid: &InstanceId) -> Result<Option<Instance>> {
        match self.database_for(instance_uuid)?.get_instance(instance_uuid) {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block devices of the durable record, or those held by the build request.
    pub fn get_bdms(&self, instance_uuid: &InstanceId) -> Result<Vec<BlockDeviceMapping>> {
        let database = self.database_for(instance_uuid)?;
        if database.contains_instance(instance_uuid) {
            return Ok(database.get_bdms(instance_uuid));
        }
        Ok(self.store.get_build_request(instance_uuid).map(|br| br.block_device_mappings).unwrap_or_default())
    }

    /// Saves to the owning cell, keeping a pending build request's copy in step.
    pub fn save_instance(&self, instance: &Instance, expected_task_state: Option<&[Option<TaskState>]>) -> Result<Instance> {
        let database = self.database_for(&instance.uuid)?;
        let placed = self.store.instance_mapping_or_none(&instance.uuid).is_some_and(|m| m.is_placed());

        if database.contains_instance(&instance.uuid) {
            let saved = database.save_instance(instance, expected_task_state)?;
            if !placed {
                if let Err(e) = self.store.save_build_request_instance(&saved) {
                    log::debug!("CellResolver: no build request to refresh for {}: {}", instance.uuid, e);
                }
            }
            return Ok(saved);
        }

        let build_request = self.store.get_build_request(&instance.uuid).map_err(|_| Error::not_found("Instance", &instance.uuid))?;
        if let Some(expected) = expected_task_state {
            if !expected.contains(&build_request.instance.task_state) {
                return Err(Error::UnexpectedTaskState {
                    instance_id: instance.uuid.clone(),
                    expected: render_expected(expected),
                    actual: task_state_str(build_request.instance.task_state).to_string(),
                });
            }
        }
        self.store.save_build_request_instance(instance)?;
        Ok(instance.clone())
    }

    /// Applies the scheduler's decision: moves the record into `cell_id`,
    /// assigns host and node, fixes the mapping and drops the build request.
    pub fn record_placement(&self, instance_uuid: &InstanceId, cell_id: &CellId, host: &HostName, node: Option<&str>) -> Result<Instance> {
        let mapping = self.store.get_instance_mapping(instance_uuid)?;
        if mapping.is_placed() {
            return Err(Error::InvalidRequest(format!("Instance {} has already been placed", instance_uuid)));
        }
        let target = self.store.cell(cell_id)?;
        let source = self.store.default_cell();

        let mut instance = match source.get_instance(instance_uuid) {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => self.store.get_build_request(instance_uuid)?.instance,
            Err(e) => return Err(e),
        };
        instance.host = Some(host.clone());
        instance.node = node.map(str::to_string);

        if target.cell_id() == source.cell_id() {
            if source.contains_instance(instance_uuid) {
                source.save_instance(&instance, None)?;
            } else {
                source.create_instance(&instance)?;
            }
        } else {
            target.create_instance(&instance)?;
            for bdm in source.take_bdms(instance_uuid) {
                target.create_bdm(instance_uuid, bdm);
            }
            if let Err(e) = source.destroy_instance(instance_uuid) {
                log::debug!("CellResolver: no staged record of {} to remove: {}", instance_uuid, e);
            }
        }

        self.store.set_mapping_cell(instance_uuid, cell_id)?;
        if let Err(e) = self.store.destroy_build_request(instance_uuid) {
            log::debug!("CellResolver: build request of {} already gone: {}", instance_uuid, e);
        }
        log::info!("CellResolver: instance {} placed on {} in cell {}", instance_uuid, host, cell_id);
        Ok(instance)
    }
}

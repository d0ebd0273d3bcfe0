use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::instance::instance::Instance;
use crate::domain::placement::build_request::BuildRequest;
use crate::domain::placement::cell_database::CellDatabase;
use crate::domain::placement::instance_mapping::InstanceMapping;
use crate::domain::utils::id::{CellId, InstanceId};
use crate::error::{Error, Result};

lazy_static! {
    /// Cell that stages instances which have not been scheduled yet.
    pub static ref CELL0_ID: CellId = CellId::new("cell0");
}

#[derive(Debug)]
struct PlacementInner {
    mappings: HashMap<InstanceId, InstanceMapping>,
    build_requests: HashMap<InstanceId, BuildRequest>,
    cells: BTreeMap<CellId, CellDatabase>,
}

/// API-level records that locate instances: instance mappings, pending
/// build requests and the registry of cell databases.
///
/// New instances are written to the default cell while their mapping still
/// points nowhere; the scheduler's decision later fixes the mapping.
#[derive(Debug, Clone)]
pub struct PlacementStore {
    inner: Arc<RwLock<PlacementInner>>,
    default_cell: CellDatabase,
}

impl Default for PlacementStore {
    fn default() -> Self {
        Self::new(CELL0_ID.clone())
    }
}

impl PlacementStore {
    pub fn new(default_cell_id: CellId) -> Self {
        let default_cell = CellDatabase::new(default_cell_id.clone());
        let cells = BTreeMap::from([(default_cell_id, default_cell.clone())]);
        let inner = PlacementInner { mappings: HashMap::new(), build_requests: HashMap::new(), cells };
        Self { inner: Arc::new(RwLock::new(inner)), default_cell }
    }

    fn read(&self) -> RwLockReadGuard<'_, PlacementInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PlacementInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    //---------------------
    // --- Cells ---

    /// Registers a cell; an existing one is returned unchanged.
    pub fn add_cell(&self, cell_id: CellId) -> CellDatabase {
        self.write().cells.entry(cell_id.clone()).or_insert_with(|| CellDatabase::new(cell_id)).clone()
    }

    pub fn cell(&self, cell_id: &CellId) -> Result<CellDatabase> {
        self.read().cells.get(cell_id).cloned().ok_or_else(|| Error::not_found("Cell", cell_id))
    }

    /// Database new instances are written to before placement.
    pub fn default_cell(&self) -> &CellDatabase {
        &self.default_cell
    }

    pub fn cells(&self) -> Vec<CellDatabase> {
        self.read().cells.values().cloned().collect()
    }

    //---------------------
    // --- Instance mappings ---

    pub fn create_instance_mapping(&self, mapping: InstanceMapping) -> Result<()> {
        let mut guard = self.write();
        if guard.mappings.contains_key(&mapping.instance_uuid) {
            return Err(Error::InstanceExists(mapping.instance_uuid));
        }
        guard.mappings.insert(mapping.instance_uuid.clone(), mapping);
        Ok(())
    }

    pub fn get_instance_mapping(&self, instance_uuid: &InstanceId) -> Result<InstanceMapping> {
        self.read().mappings.get(instance_uuid).cloned().ok_or_else(|| Error::not_found("Instance mapping", instance_uuid))
    }

    pub fn instance_mapping_or_none(&self, instance_uuid: &InstanceId) -> Option<InstanceMapping> {
        self.read().mappings.get(instance_uuid).cloned()
    }

    /// Points a pending mapping at its cell. A mapping is placed only once.
    pub fn set_mapping_cell(&self, instance_uuid: &InstanceId, cell_id: &CellId) -> Result<()> {
        let mut guard = self.write();
        let mapping =
            guard.mappings.get_mut(instance_uuid).ok_or_else(|| Error::not_found("Instance mapping", instance_uuid))?;
        if let Some(existing) = &mapping.cell_id {
            return Err(Error::InvalidRequest(format!("Instance {} is already mapped to cell {}", instance_uuid, existing)));
        }
        mapping.cell_id = Some(cell_id.clone());
        Ok(())
    }

    pub fn destroy_instance_mapping(&self, instance_uuid: &InstanceId) -> Result<()> {
        self.write()
            .mappings
            .remove(instance_uuid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Instance mapping", instance_uuid))
    }

    //---------------------
    // --- Build requests ---

    pub fn create_build_request(&self, build_request: BuildRequest) -> Result<()> {
        let mut guard = self.write();
        if guard.build_requests.contains_key(&build_request.instance_uuid) {
            return Err(Error::InstanceExists(build_request.instance_uuid));
        }
        guard.build_requests.insert(build_request.instance_uuid.clone(), build_request);
        Ok(())
    }

    pub fn get_build_request(&self, instance_uuid: &InstanceId) -> Result<BuildRequest> {
        self.read().build_requests.get(instance_uuid).cloned().ok_or_else(|| Error::not_found("Build request", instance_uuid))
    }

    /// Refreshes the instance copy held by a pending build request.
    pub fn save_build_request_instance(&self, instance: &Instance) -> Result<()> {
        let mut guard = self.write();
        let build_request =
            guard.build_requests.get_mut(&instance.uuid).ok_or_else(|| Error::not_found("Build request", &instance.uuid))?;
        build_request.instance = instance.clone();
        Ok(())
    }

    pub fn destroy_build_request(&self, instance_uuid: &InstanceId) -> Result<()> {
        self.write()
            .build_requests
            .remove(instance_uuid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Build request", instance_uuid))
    }

    pub fn pending_build_requests(&self) -> usize {
        self.read().build_requests.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.read().mappings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::utils::id::ProjectId;

    #[test]
    fn mapping_is_placed_once() {
        let store = PlacementStore::new(CellId::new("cell0"));
        let uuid = InstanceId::generate();
        store.create_instance_mapping(InstanceMapping::pending(uuid.clone(), ProjectId::new("p1"))).unwrap();

        store.set_mapping_cell(&uuid, &CellId::new("cell1")).unwrap();
        assert!(store.get_instance_mapping(&uuid).unwrap().is_placed());
        assert!(store.set_mapping_cell(&uuid, &CellId::new("cell2")).is_err());
    }

    #[test]
    fn missing_build_request_is_not_found() {
        let store = PlacementStore::new(CellId::new("cell0"));
        assert!(store.destroy_build_request(&InstanceId::generate()).unwrap_err().is_not_found());
    }
}

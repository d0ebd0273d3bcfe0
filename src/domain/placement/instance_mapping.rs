use serde::Serialize;

use crate::domain::utils::id::{CellId, InstanceId, ProjectId};

/// Binds an instance to the cell that owns it. `cell_id` stays `None` until
/// the scheduler has placed the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceMapping {
    pub instance_uuid: InstanceId,
    pub cell_id: Option<CellId>,
    pub project_id: ProjectId,
}

impl InstanceMapping {
    pub fn pending(instance_uuid: InstanceId, project_id: ProjectId) -> Self {
        Self { instance_uuid, cell_id: None, project_id }
    }

    pub fn is_placed(&self) -> bool {
        self.cell_id.is_some()
    }
}

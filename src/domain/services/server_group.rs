use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::utils::id::{InstanceId, ServerGroupId, UserId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGroup {
    pub id: ServerGroupId,
    pub name: String,
    pub policies: Vec<String>,
    /// Members with the user that created them.
    pub members: Vec<(InstanceId, UserId)>,
}

pub trait ServerGroupService: Debug + Send + Sync {
    fn get(&self, group_id: &ServerGroupId) -> Result<ServerGroup>;

    fn count_members_by_user(&self, group_id: &ServerGroupId, user_id: &UserId) -> Result<i64>;

    fn add_members(&self, group_id: &ServerGroupId, user_id: &UserId, instances: &[InstanceId]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryServerGroupService {
    groups: Arc<RwLock<HashMap<ServerGroupId, ServerGroup>>>,
}

impl InMemoryServerGroupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, group: ServerGroup) {
        self.groups.write().unwrap_or_else(PoisonError::into_inner).insert(group.id.clone(), group);
    }
}

impl ServerGroupService for InMemoryServerGroupService {
    fn get(&self, group_id: &ServerGroupId) -> Result<ServerGroup> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Server group", group_id))
    }

    fn count_members_by_user(&self, group_id: &ServerGroupId, user_id: &UserId) -> Result<i64> {
        let group = self.get(group_id)?;
        Ok(group.members.iter().filter(|(_, owner)| owner == user_id).count() as i64)
    }

    fn add_members(&self, group_id: &ServerGroupId, user_id: &UserId, instances: &[InstanceId]) -> Result<()> {
        let mut guard = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let group = guard.get_mut(group_id).ok_or_else(|| Error::not_found("Server group", group_id))?;
        group.members.extend(instances.iter().map(|uuid| (uuid.clone(), user_id.clone())));
        Ok(())
    }
}

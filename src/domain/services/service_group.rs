use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::utils::id::HostName;
use crate::error::{Error, Result};

/// Liveness of compute host services.
pub trait ServiceGroup: Debug + Send + Sync {
    /// `Err(NotFound)` when no compute service is registered for `host`.
    fn service_is_up(&self, host: &HostName) -> Result<bool>;
}

/// Host liveness table held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServiceGroup {
    hosts: Arc<RwLock<HashMap<HostName, bool>>>,
}

impl InMemoryServiceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_host(&self, host: &HostName, up: bool) {
        self.hosts.write().unwrap_or_else(PoisonError::into_inner).insert(host.clone(), up);
    }
}

impl ServiceGroup for InMemoryServiceGroup {
    fn service_is_up(&self, host: &HostName) -> Result<bool> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .copied()
            .ok_or_else(|| Error::not_found("Compute host", host))
    }
}

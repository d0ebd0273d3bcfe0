use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::instance::flavor::Flavor;
use crate::domain::utils::id::FlavorId;
use crate::error::{Error, Result};

/// Catalog of resource templates.
pub trait FlavorCatalog: Debug + Send + Sync {
    fn get_by_flavor_id(&self, flavor_id: &FlavorId) -> Result<Flavor>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryFlavorCatalog {
    flavors: Arc<RwLock<HashMap<FlavorId, Flavor>>>,
}

impl InMemoryFlavorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, flavor: Flavor) {
        self.flavors.write().unwrap_or_else(PoisonError::into_inner).insert(flavor.flavorid.clone(), flavor);
    }
}

impl FlavorCatalog for InMemoryFlavorCatalog {
    fn get_by_flavor_id(&self, flavor_id: &FlavorId) -> Result<Flavor> {
        self.flavors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flavor_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Flavor", flavor_id))
    }
}

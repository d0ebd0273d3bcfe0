use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::utils::id::{InstanceId, NetworkId, PortId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub network_id: Option<NetworkId>,
    pub address: Option<String>,
    pub port_id: Option<PortId>,
}

/// Networks asked for at boot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestedNetworks {
    /// Let the network service pick.
    #[default]
    Auto,
    /// Boot without any network.
    NoAllocate,
    Explicit(Vec<NetworkRequest>),
}

impl RequestedNetworks {
    pub fn no_allocate(&self) -> bool {
        matches!(self, RequestedNetworks::NoAllocate)
    }

    pub fn has_port_ids(&self) -> bool {
        match self {
            RequestedNetworks::Explicit(requests) => requests.iter().any(|r| r.port_id.is_some()),
            _ => false,
        }
    }
}

pub trait NetworkService: Debug + Send + Sync {
    /// Returns how many of `max_count` instances the port quota allows.
    fn validate_networks(&self, ctx: &RequestContext, requested: &RequestedNetworks, max_count: u32) -> Result<u32>;

    fn allocate_for_instance(&self, ctx: &RequestContext, instance: &Instance, requested: &RequestedNetworks) -> Result<()>;

    fn deallocate_for_instance(&self, ctx: &RequestContext, instance: &Instance) -> Result<()>;

    fn get_floating_ip_pools(&self, ctx: &RequestContext) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct NetworkInner {
    available_ports: Option<u32>,
    allocations: HashSet<InstanceId>,
    deallocations: Vec<InstanceId>,
    floating_ip_pools: Vec<String>,
}

/// Network backend held in process memory. `available_ports` bounds how
/// many instances `validate_networks` admits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetworkService {
    inner: Arc<RwLock<NetworkInner>>,
}

impl InMemoryNetworkService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_available_ports(self, ports: u32) -> Self {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).available_ports = Some(ports);
        self
    }

    pub fn with_floating_ip_pools(self, pools: Vec<String>) -> Self {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).floating_ip_pools = pools;
        self
    }

    pub fn deallocations(&self) -> Vec<InstanceId> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).deallocations.clone()
    }
}

impl NetworkService for InMemoryNetworkService {
    fn validate_networks(&self, _ctx: &RequestContext, requested: &RequestedNetworks, max_count: u32) -> Result<u32> {
        if requested.has_port_ids() && max_count > 1 {
            return Err(Error::InvalidRequest(
                "Unable to launch multiple instances with a single configured port ID.".to_string(),
            ));
        }

        let ports_per_instance = match requested {
            RequestedNetworks::NoAllocate => return Ok(max_count),
            RequestedNetworks::Auto => 1,
            RequestedNetworks::Explicit(requests) => requests.iter().filter(|r| r.port_id.is_none()).count().max(1) as u32,
        };

        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match guard.available_ports {
            Some(ports) => max_count.min(ports / ports_per_instance),
            None => max_count,
        })
    }

    fn allocate_for_instance(&self, _ctx: &RequestContext, instance: &Instance, requested: &RequestedNetworks) -> Result<()> {
        if requested.no_allocate() {
            return Ok(());
        }
        self.inner.write().unwrap_or_else(PoisonError::into_inner).allocations.insert(instance.uuid.clone());
        Ok(())
    }

    fn deallocate_for_instance(&self, _ctx: &RequestContext, instance: &Instance) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.allocations.remove(&instance.uuid);
        guard.deallocations.push(instance.uuid.clone());
        Ok(())
    }

    fn get_floating_ip_pools(&self, _ctx: &RequestContext) -> Result<Vec<String>> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).floating_ip_pools.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("p1", "u1")
    }

    #[test]
    fn port_budget_bounds_instance_count() {
        let network = InMemoryNetworkService::new().with_available_ports(3);
        assert_eq!(network.validate_networks(&ctx(), &RequestedNetworks::Auto, 5).unwrap(), 3);
        assert_eq!(network.validate_networks(&ctx(), &RequestedNetworks::NoAllocate, 5).unwrap(), 5);
    }

    #[test]
    fn single_port_cannot_serve_many_instances() {
        let request = RequestedNetworks::Explicit(vec![NetworkRequest {
            network_id: None,
            address: None,
            port_id: Some(PortId::new("port-1")),
        }]);
        assert!(InMemoryNetworkService::new().validate_networks(&ctx(), &request, 2).is_err());
    }
}

use std::sync::Arc;

use crate::domain::block_device::resolver::StorageTopologyResolver;
use crate::domain::compute::guard::check_instance_host;
use crate::domain::compute::notifications::send_update_with_states;
use crate::domain::config::ComputeConfig;
use crate::domain::context::RequestContext;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::vm_state::TaskState;
use crate::domain::placement::cell_resolver::CellAwareResolver;
use crate::domain::placement::placement_store::PlacementStore;
use crate::domain::quota::ledger::QuotaLedger;
use crate::domain::services::compute_rpc::{ComputeRpc, HostWorkOrder, InMemoryComputeRpc};
use crate::domain::services::conductor::{ComputeTaskApi, InMemoryComputeTaskApi};
use crate::domain::services::flavor_catalog::{FlavorCatalog, InMemoryFlavorCatalog};
use crate::domain::services::image::{ImageService, InMemoryImageService};
use crate::domain::services::key_pair::{InMemoryKeyPairService, KeyPairService};
use crate::domain::services::network::{InMemoryNetworkService, NetworkService};
use crate::domain::services::security_group::{InMemorySecurityGroupService, SecurityGroupService};
use crate::domain::services::server_group::{InMemoryServerGroupService, ServerGroupService};
use crate::domain::services::service_group::{InMemoryServiceGroup, ServiceGroup};
use crate::domain::services::volume::{InMemoryVolumeService, VolumeService};
use crate::domain::utils::id::InstanceId;
use crate::error::{Error, Result};

/// Remote services the orchestrator talks to, one backend each.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub image_service: Arc<dyn ImageService>,
    pub volume_service: Arc<dyn VolumeService>,
    pub network_service: Arc<dyn NetworkService>,
    pub compute_rpc: Arc<dyn ComputeRpc>,
    pub compute_task_api: Arc<dyn ComputeTaskApi>,
    pub service_group: Arc<dyn ServiceGroup>,
    pub security_groups: Arc<dyn SecurityGroupService>,
    pub key_pairs: Arc<dyn KeyPairService>,
    pub server_groups: Arc<dyn ServerGroupService>,
    pub flavors: Arc<dyn FlavorCatalog>,
}

impl Collaborators {
    /// Every collaborator backed by process memory. Security groups charge
    /// their quota against `quota`.
    pub fn in_memory(quota: &QuotaLedger) -> Self {
        Self {
            image_service: Arc::new(InMemoryImageService::new()),
            volume_service: Arc::new(InMemoryVolumeService::new()),
            network_service: Arc::new(InMemoryNetworkService::new()),
            compute_rpc: Arc::new(InMemoryComputeRpc::new()),
            compute_task_api: Arc::new(InMemoryComputeTaskApi::new()),
            service_group: Arc::new(InMemoryServiceGroup::new()),
            security_groups: Arc::new(InMemorySecurityGroupService::new(quota.clone())),
            key_pairs: Arc::new(InMemoryKeyPairService::new()),
            server_groups: Arc::new(InMemoryServerGroupService::new()),
            flavors: Arc::new(InMemoryFlavorCatalog::new()),
        }
    }
}

/// Entry point for creating instances and driving their lifecycle.
///
/// Every operation resolves its target through the [`CellAwareResolver`],
/// checks the operation's guard, records the new task state with an
/// optimistic save and then hands the actual work to a remote worker. The
/// operations themselves live in the sibling modules (`creation`, `delete`,
/// `power`, `lifecycle`, `resize`, `volumes`, `metadata`).
#[derive(Debug, Clone)]
pub struct ComputeApi {
    pub(crate) config: ComputeConfig,
    pub(crate) quota: QuotaLedger,
    pub(crate) resolver: CellAwareResolver,
    pub(crate) storage: StorageTopologyResolver,
    pub(crate) services: Collaborators,
}

impl ComputeApi {
    pub fn new(config: ComputeConfig, quota: QuotaLedger, placement: PlacementStore, services: Collaborators) -> Self {
        let storage =
            StorageTopologyResolver::new(services.image_service.clone(), services.volume_service.clone(), &config);
        log::info!(
            "ComputeApi: initialized with default cell {} (cell type {})",
            placement.default_cell().cell_id(),
            config.cell_type.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
        );
        Self { config, quota, resolver: CellAwareResolver::new(placement), storage, services }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn resolver(&self) -> &CellAwareResolver {
        &self.resolver
    }

    pub fn storage(&self) -> &StorageTopologyResolver {
        &self.storage
    }

    /// Looks the instance up wherever it currently lives.
    ///
    /// Instances of other projects are invisible to non-admin callers.
    pub fn get(&self, ctx: &RequestContext, instance_uuid: &InstanceId) -> Result<Instance> {
        let instance = self.resolver.get_instance(instance_uuid)?;
        if !ctx.is_admin && instance.project_id != ctx.project_id {
            return Err(Error::not_found("Instance", instance_uuid));
        }
        Ok(instance)
    }

    //---------------------
    // --- Shared transition helpers ---

    /// Persists `instance` with a new task state, provided the stored record
    /// is still in one of `expected`, and announces the change.
    pub(crate) fn set_task_state(
        &self,
        ctx: &RequestContext,
        instance: &mut Instance,
        task_state: Option<TaskState>,
        expected: &[Option<TaskState>],
    ) -> Result<()> {
        let old_task_state = instance.task_state;
        instance.task_state = task_state;
        *instance = self.resolver.save_instance(instance, Some(expected))?;
        log::debug!(
            "ComputeApi {}: task state {:?} -> {:?}",
            instance.uuid,
            old_task_state.map(|t| t.as_str()),
            task_state.map(|t| t.as_str())
        );
        send_update_with_states(ctx, instance, instance.vm_state, instance.vm_state, old_task_state, task_state);
        Ok(())
    }

    /// Sends `order` to the worker on the instance's host.
    pub(crate) fn cast_to_host(&self, ctx: &RequestContext, instance: &Instance, order: HostWorkOrder) -> Result<()> {
        let host = check_instance_host(instance)?;
        log::info!("ComputeApi {}: dispatching {} to {}", instance.uuid, order.verb(), host);
        self.services.compute_rpc.cast(ctx, host, instance, order)
    }
}

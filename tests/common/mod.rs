#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use compute_orchestrator::domain::compute::{Collaborators, ComputeApi, CreateRequest};
use compute_orchestrator::domain::config::ComputeConfig;
use compute_orchestrator::domain::context::RequestContext;
use compute_orchestrator::domain::instance::flavor::Flavor;
use compute_orchestrator::domain::instance::instance::Instance;
use compute_orchestrator::domain::instance::vm_state::{TaskState, VmState};
use compute_orchestrator::domain::placement::placement_store::PlacementStore;
use compute_orchestrator::domain::quota::ledger::QuotaLedger;
use compute_orchestrator::domain::quota::resource::QuotaResource;
use compute_orchestrator::domain::services::compute_rpc::{ComputeRpc, HostWorkOrder, InMemoryComputeRpc};
use compute_orchestrator::domain::services::conductor::{ComputeTaskApi, ConductorTask, InMemoryComputeTaskApi};
use compute_orchestrator::domain::services::flavor_catalog::InMemoryFlavorCatalog;
use compute_orchestrator::domain::services::image::{ImageMeta, InMemoryImageService};
use compute_orchestrator::domain::services::key_pair::InMemoryKeyPairService;
use compute_orchestrator::domain::services::network::InMemoryNetworkService;
use compute_orchestrator::domain::services::security_group::InMemorySecurityGroupService;
use compute_orchestrator::domain::services::server_group::{InMemoryServerGroupService, ServerGroup, ServerGroupService};
use compute_orchestrator::domain::services::service_group::InMemoryServiceGroup;
use compute_orchestrator::domain::services::volume::{InMemoryVolumeService, Snapshot, Volume, VolumeService};
use compute_orchestrator::domain::utils::id::{AttachmentId, HostName, ImageId, InstanceId, ServerGroupId, SnapshotId, UserId, VolumeId};
use compute_orchestrator::error::{Error, Result};

pub const PROJECT: &str = "project-a";
pub const USER: &str = "user-a";
pub const HOST: &str = "compute-1";
pub const NODE: &str = "node-1";

pub fn small_flavor() -> Flavor {
    Flavor::new("m1.small", 1, 512, 1)
}

pub fn medium_flavor() -> Flavor {
    Flavor::new("m1.medium", 2, 1024, 2)
}

/// Server group backend that fails the `fail_on`-th (1-based) `add_members` call.
#[derive(Debug)]
pub struct FlakyServerGroups {
    inner: InMemoryServerGroupService,
    fail_on: usize,
    calls: AtomicUsize,
}

impl FlakyServerGroups {
    pub fn new(inner: InMemoryServerGroupService, fail_on: usize) -> Self {
        Self { inner, fail_on, calls: AtomicUsize::new(0) }
    }
}

impl ServerGroupService for FlakyServerGroups {
    fn get(&self, group_id: &ServerGroupId) -> Result<ServerGroup> {
        self.inner.get(group_id)
    }

    fn count_members_by_user(&self, group_id: &ServerGroupId, user_id: &UserId) -> Result<i64> {
        self.inner.count_members_by_user(group_id, user_id)
    }

    fn add_members(&self, group_id: &ServerGroupId, user_id: &UserId, instances: &[InstanceId]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(injected_failure("server_groups", group_id));
        }
        self.inner.add_members(group_id, user_id, instances)
    }
}

fn injected_failure(service: &'static str, resource_id: impl ToString) -> Error {
    Error::ExternalService { service, resource_id: resource_id.to_string(), reason: "injected failure".to_string() }
}

/// Conductor that refuses every task.
#[derive(Debug, Default)]
pub struct UnreachableConductor;

impl ComputeTaskApi for UnreachableConductor {
    fn submit(&self, _ctx: &RequestContext, task: ConductorTask) -> Result<()> {
        Err(injected_failure("conductor", task.name()))
    }
}

/// Host RPC that refuses orders with one verb and records the rest.
#[derive(Debug)]
pub struct RefusingComputeRpc {
    inner: InMemoryComputeRpc,
    refused_verb: &'static str,
}

impl ComputeRpc for RefusingComputeRpc {
    fn cast(&self, ctx: &RequestContext, host: &HostName, instance: &Instance, order: HostWorkOrder) -> Result<()> {
        if order.verb() == self.refused_verb {
            return Err(injected_failure("compute", host));
        }
        self.inner.cast(ctx, host, instance, order)
    }

    fn reserve_block_device_name(
        &self,
        ctx: &RequestContext,
        host: &HostName,
        instance: &Instance,
        device: Option<&str>,
        volume_id: &VolumeId,
    ) -> Result<String> {
        self.inner.reserve_block_device_name(ctx, host, instance, device, volume_id)
    }
}

/// Volume backend whose `fail_on`-th (1-based) snapshot lookup fails.
#[derive(Debug)]
pub struct FlakyVolumes {
    inner: InMemoryVolumeService,
    fail_on: usize,
    calls: AtomicUsize,
}

impl VolumeService for FlakyVolumes {
    fn get(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<Volume> {
        self.inner.get(ctx, volume_id)
    }

    fn get_snapshot(&self, ctx: &RequestContext, snapshot_id: &SnapshotId) -> Result<Snapshot> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(injected_failure("volume", snapshot_id));
        }
        self.inner.get_snapshot(ctx, snapshot_id)
    }

    fn reserve_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.inner.reserve_volume(ctx, volume_id)
    }

    fn unreserve_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.inner.unreserve_volume(ctx, volume_id)
    }

    fn begin_detaching(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.inner.begin_detaching(ctx, volume_id)
    }

    fn roll_detaching(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.inner.roll_detaching(ctx, volume_id)
    }

    fn attach(&self, ctx: &RequestContext, volume_id: &VolumeId, instance_uuid: &InstanceId, mountpoint: &str) -> Result<()> {
        self.inner.attach(ctx, volume_id, instance_uuid, mountpoint)
    }

    fn detach(
        &self,
        ctx: &RequestContext,
        volume_id: &VolumeId,
        instance_uuid: &InstanceId,
        attachment_id: Option<&AttachmentId>,
    ) -> Result<()> {
        self.inner.detach(ctx, volume_id, instance_uuid, attachment_id)
    }

    fn terminate_connection(&self, ctx: &RequestContext, volume_id: &VolumeId, connector_host: &str) -> Result<()> {
        self.inner.terminate_connection(ctx, volume_id, connector_host)
    }

    fn create_snapshot_force(
        &self,
        ctx: &RequestContext,
        volume_id: &VolumeId,
        name: &str,
        description: &str,
    ) -> Result<Snapshot> {
        self.inner.create_snapshot_force(ctx, volume_id, name, description)
    }

    fn delete(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<()> {
        self.inner.delete(ctx, volume_id)
    }
}

/// A `ComputeApi` wired to in-memory collaborators, with a handle kept to
/// each of them for assertions.
pub struct Harness {
    pub api: ComputeApi,
    pub quota: QuotaLedger,
    pub images: InMemoryImageService,
    pub volumes: InMemoryVolumeService,
    pub network: InMemoryNetworkService,
    pub rpc: InMemoryComputeRpc,
    pub conductor: InMemoryComputeTaskApi,
    pub service_group: InMemoryServiceGroup,
    pub server_groups: InMemoryServerGroupService,
    pub flavors: InMemoryFlavorCatalog,
    pub key_pairs: InMemoryKeyPairService,
    pub image_id: ImageId,
}

pub struct HarnessBuilder {
    config: ComputeConfig,
    network: InMemoryNetworkService,
    failing_group_add: Option<usize>,
    failing_snapshot_lookup: Option<usize>,
    refused_host_verb: Option<&'static str>,
    unreachable_conductor: bool,
}

impl HarnessBuilder {
    pub fn config(mut self, config: ComputeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn network(mut self, network: InMemoryNetworkService) -> Self {
        self.network = network;
        self
    }

    pub fn fail_group_add_on(mut self, call: usize) -> Self {
        self.failing_group_add = Some(call);
        self
    }

    pub fn fail_snapshot_lookup_on(mut self, call: usize) -> Self {
        self.failing_snapshot_lookup = Some(call);
        self
    }

    pub fn refuse_host_order(mut self, verb: &'static str) -> Self {
        self.refused_host_verb = Some(verb);
        self
    }

    pub fn unreachable_conductor(mut self) -> Self {
        self.unreachable_conductor = true;
        self
    }

    pub fn build(self) -> Harness {
        let quota = QuotaLedger::new(&self.config.quota, self.config.reservation_expire);
        let images = InMemoryImageService::new();
        let volumes = InMemoryVolumeService::new();
        let rpc = InMemoryComputeRpc::new();
        let conductor = InMemoryComputeTaskApi::new();
        let service_group = InMemoryServiceGroup::new();
        let server_groups = InMemoryServerGroupService::new();
        let flavors = InMemoryFlavorCatalog::new();
        let key_pairs = InMemoryKeyPairService::new();

        let server_group_backend: Arc<dyn ServerGroupService> = match self.failing_group_add {
            Some(call) => Arc::new(FlakyServerGroups::new(server_groups.clone(), call)),
            None => Arc::new(server_groups.clone()),
        };

        let volume_backend: Arc<dyn VolumeService> = match self.failing_snapshot_lookup {
            Some(call) => Arc::new(FlakyVolumes { inner: volumes.clone(), fail_on: call, calls: AtomicUsize::new(0) }),
            None => Arc::new(volumes.clone()),
        };
        let rpc_backend: Arc<dyn ComputeRpc> = match self.refused_host_verb {
            Some(verb) => Arc::new(RefusingComputeRpc { inner: rpc.clone(), refused_verb: verb }),
            None => Arc::new(rpc.clone()),
        };
        let conductor_backend: Arc<dyn ComputeTaskApi> =
            if self.unreachable_conductor { Arc::new(UnreachableConductor) } else { Arc::new(conductor.clone()) };

        let services = Collaborators {
            image_service: Arc::new(images.clone()),
            volume_service: volume_backend,
            network_service: Arc::new(self.network.clone()),
            compute_rpc: rpc_backend,
            compute_task_api: conductor_backend,
            service_group: Arc::new(service_group.clone()),
            security_groups: Arc::new(InMemorySecurityGroupService::new(quota.clone())),
            key_pairs: Arc::new(key_pairs.clone()),
            server_groups: server_group_backend,
            flavors: Arc::new(flavors.clone()),
        };

        let image_id = images.add(ImageMeta::active("cirros"));
        flavors.add(small_flavor());
        flavors.add(medium_flavor());

        let api = ComputeApi::new(self.config, quota.clone(), PlacementStore::default(), services);
        Harness {
            api,
            quota,
            images,
            volumes,
            network: self.network,
            rpc,
            conductor,
            service_group,
            server_groups,
            flavors,
            key_pairs,
            image_id,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: ComputeConfig::default(),
            network: InMemoryNetworkService::new(),
            failing_group_add: None,
            failing_snapshot_lookup: None,
            refused_host_verb: None,
            unreachable_conductor: false,
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::new(PROJECT, USER)
    }

    pub fn admin(&self) -> RequestContext {
        RequestContext::admin("admin-project", "admin")
    }

    pub fn image_request(&self) -> CreateRequest {
        CreateRequest::new(small_flavor(), Some(self.image_id.clone()))
    }

    /// Creates one instance from the default image; it stays unplaced.
    pub fn boot_pending(&self) -> Instance {
        let (mut instances, _) = self.api.create(&self.ctx(), self.image_request()).expect("create");
        instances.remove(0)
    }

    /// Creates one instance and lets it land ACTIVE on `HOST`.
    pub fn boot_active(&self) -> Instance {
        let instance = self.boot_pending();
        self.launch(&instance.uuid)
    }

    /// What the scheduler and the host worker would do for a new instance.
    pub fn launch(&self, uuid: &InstanceId) -> Instance {
        let resolver = self.api.resolver();
        let cell_id = resolver.store().default_cell().cell_id().clone();
        let mut instance = resolver.record_placement(uuid, &cell_id, &HostName::new(HOST), Some(NODE)).expect("placement");
        instance.vm_state = VmState::Active;
        instance.task_state = None;
        instance.launched_at = Some(Utc::now());
        resolver.save_instance(&instance, None).expect("save")
    }

    /// Forces a state, as a host worker finishing a task would.
    pub fn set_states(&self, uuid: &InstanceId, vm_state: VmState, task_state: Option<TaskState>) -> Instance {
        let resolver = self.api.resolver();
        let mut instance = resolver.get_instance(uuid).expect("instance");
        instance.vm_state = vm_state;
        instance.task_state = task_state;
        resolver.save_instance(&instance, None).expect("save")
    }

    pub fn in_use(&self, resource: QuotaResource) -> i64 {
        self.quota.usages(&self.ctx().project_id, Some(&self.ctx().user_id)).get(&resource).map(|u| u.in_use).unwrap_or(0)
    }

    pub fn reserved(&self, resource: QuotaResource) -> i64 {
        self.quota.usages(&self.ctx().project_id, Some(&self.ctx().user_id)).get(&resource).map(|u| u.reserved).unwrap_or(0)
    }

    /// `(instances, cores, ram)` in use by the default user.
    pub fn instance_usage(&self) -> (i64, i64, i64) {
        (self.in_use(QuotaResource::Instances), self.in_use(QuotaResource::Cores), self.in_use(QuotaResource::Ram))
    }
}

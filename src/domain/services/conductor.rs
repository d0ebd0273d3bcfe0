use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::block_device::mapping::BlockDeviceMapping;
use crate::domain::context::RequestContext;
use crate::domain::instance::flavor::Flavor;
use crate::domain::instance::instance::Instance;
use crate::domain::services::image::ImageMeta;
use crate::domain::services::network::RequestedNetworks;
use crate::domain::utils::id::{HostName, ImageId, InstanceId, ServerGroupId};
use crate::error::Result;

/// Hints and constraints forwarded to the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterProperties {
    pub scheduler_hints: BTreeMap<String, String>,
    pub force_hosts: Vec<HostName>,
    pub force_nodes: Vec<String>,
    pub ignore_hosts: Vec<HostName>,
    pub instance_group: Option<ServerGroupId>,
}

/// Destination requested by an admin for migrations and evacuations.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedDestination {
    pub host: HostName,
    pub node: Option<String>,
}

/// Work handed to the scheduler/conductor tier.
#[derive(Debug, Clone)]
pub enum ConductorTask {
    BuildInstances {
        instances: Vec<Instance>,
        image: ImageMeta,
        filter_properties: FilterProperties,
        admin_password: Option<String>,
        injected_files: Vec<(String, String)>,
        requested_networks: RequestedNetworks,
        security_groups: Vec<String>,
        block_device_mapping: Vec<BlockDeviceMapping>,
    },
    ResizeInstance {
        instance: Instance,
        flavor: Flavor,
        filter_properties: FilterProperties,
        clean_shutdown: bool,
    },
    RebuildInstance {
        instance: Instance,
        orig_image_ref: Option<ImageId>,
        image_ref: Option<ImageId>,
        new_pass: Option<String>,
        injected_files: Vec<(String, String)>,
        orig_sys_metadata: BTreeMap<String, String>,
        preserve_ephemeral: bool,
        recreate: bool,
        on_shared_storage: bool,
        host: Option<HostName>,
        requested_destination: Option<RequestedDestination>,
    },
    LiveMigrateInstance {
        instance: Instance,
        block_migration: bool,
        disk_over_commit: bool,
        requested_destination: Option<RequestedDestination>,
    },
    UnshelveInstance {
        instance: Instance,
    },
}

impl ConductorTask {
    pub fn name(&self) -> &'static str {
        match self {
            ConductorTask::BuildInstances { .. } => "build_instances",
            ConductorTask::ResizeInstance { .. } => "resize_instance",
            ConductorTask::RebuildInstance { .. } => "rebuild_instance",
            ConductorTask::LiveMigrateInstance { .. } => "live_migrate_instance",
            ConductorTask::UnshelveInstance { .. } => "unshelve_instance",
        }
    }

    pub fn instance_uuids(&self) -> Vec<InstanceId> {
        match self {
            ConductorTask::BuildInstances { instances, .. } => instances.iter().map(|i| i.uuid.clone()).collect(),
            ConductorTask::ResizeInstance { instance, .. }
            | ConductorTask::RebuildInstance { instance, .. }
            | ConductorTask::LiveMigrateInstance { instance, .. }
            | ConductorTask::UnshelveInstance { instance } => vec![instance.uuid.clone()],
        }
    }
}

/// Fire-and-forget channel to the scheduler/conductor tier.
pub trait ComputeTaskApi: Debug + Send + Sync {
    fn submit(&self, ctx: &RequestContext, task: ConductorTask) -> Result<()>;
}

/// Keeps submitted tasks in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryComputeTaskApi {
    tasks: Arc<RwLock<Vec<ConductorTask>>>,
}

impl InMemoryComputeTaskApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<ConductorTask> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks().iter().map(ConductorTask::name).collect()
    }
}

impl ComputeTaskApi for InMemoryComputeTaskApi {
    fn submit(&self, _ctx: &RequestContext, task: ConductorTask) -> Result<()> {
        log::debug!("ComputeTaskApi: {} for {:?}", task.name(), task.instance_uuids());
        self.tasks.write().unwrap_or_else(PoisonError::into_inner).push(task);
        Ok(())
    }
}

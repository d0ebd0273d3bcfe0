use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;

use crate::domain::block_device::mapping::{
    BlockDeviceMapping, DEFAULT_ROOT_DEV_NAME, DestinationType, SourceType, prepend_dev, root_bdm,
};
use crate::domain::block_device::resolver::{BlockDeviceRequest, TopologyRequest, properties_root_device_name};
use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::notifications::{InstanceAction, record_action_start, send_update};
use crate::domain::config::CellType;
use crate::domain::context::RequestContext;
use crate::domain::instance::flavor::Flavor;
use crate::domain::instance::instance::Instance;
use crate::domain::instance::resources::{numa_constraints, pci_requests};
use crate::domain::instance::vm_state::{TaskState, VmState};
use crate::domain::placement::build_request::BuildRequest;
use crate::domain::placement::instance_mapping::InstanceMapping;
use crate::domain::quota::ledger::QuotaDeltas;
use crate::domain::quota::reservation::QuotaReservation;
use crate::domain::quota::resource::QuotaResource;
use crate::domain::services::conductor::{ConductorTask, FilterProperties};
use crate::domain::services::image::{IMAGE_STATUS_ACTIVE, ImageMeta};
use crate::domain::services::network::RequestedNetworks;
use crate::domain::services::security_group::DEFAULT_SECURITY_GROUP;
use crate::domain::utils::id::{HostName, ImageId, InstanceId, ServerGroupId};
use crate::domain::utils::strutils::{generate_uid, sanitize_hostname, strict_bool_from_string};
use crate::error::{Error, Result};

const GIB: i64 = 1024 * 1024 * 1024;
const SERVER_GROUP_HINT: &str = "group";

/// Everything a caller may specify when booting instances.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub flavor: Flavor,
    /// `None` boots from a volume described by `block_devices`.
    pub image_href: Option<ImageId>,
    pub kernel_id: Option<ImageId>,
    pub ramdisk_id: Option<ImageId>,
    pub min_count: Option<u32>,
    pub max_count: Option<u32>,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub key_name: Option<String>,
    pub key_data: Option<String>,
    pub security_groups: Vec<String>,
    /// `zone`, `zone:host`, `zone::node` or `zone:host:node`.
    pub availability_zone: Option<String>,
    /// Base64 encoded.
    pub user_data: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub injected_files: Vec<(String, String)>,
    pub admin_password: Option<String>,
    pub block_devices: BlockDeviceRequest,
    pub access_ip_v4: Option<String>,
    pub access_ip_v6: Option<String>,
    pub requested_networks: RequestedNetworks,
    pub config_drive: Option<String>,
    pub auto_disk_config: Option<bool>,
    pub scheduler_hints: BTreeMap<String, String>,
    pub shutdown_terminate: bool,
    pub check_server_group_quota: bool,
}

impl CreateRequest {
    pub fn new(flavor: Flavor, image_href: Option<ImageId>) -> Self {
        Self {
            flavor,
            image_href,
            kernel_id: None,
            ramdisk_id: None,
            min_count: None,
            max_count: None,
            display_name: None,
            display_description: None,
            key_name: None,
            key_data: None,
            security_groups: Vec::new(),
            availability_zone: None,
            user_data: None,
            metadata: BTreeMap::new(),
            injected_files: Vec::new(),
            admin_password: None,
            block_devices: BlockDeviceRequest::default(),
            access_ip_v4: None,
            access_ip_v6: None,
            requested_networks: RequestedNetworks::Auto,
            config_drive: None,
            auto_disk_config: None,
            scheduler_hints: BTreeMap::new(),
            shutdown_terminate: true,
            check_server_group_quota: false,
        }
    }

    pub fn with_count(mut self, min_count: u32, max_count: u32) -> Self {
        self.min_count = Some(min_count);
        self.max_count = Some(max_count);
        self
    }

    pub fn with_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_block_devices(mut self, block_devices: BlockDeviceRequest) -> Self {
        self.block_devices = block_devices;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_scheduler_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scheduler_hints.insert(key.into(), value.into());
        self
    }
}

/// Zone plus an optional forced host and node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityZoneTarget {
    pub zone: Option<String>,
    pub forced_host: Option<HostName>,
    pub forced_node: Option<String>,
}

/// Splits `zone[:host[:node]]`; `zone::node` forces only the node. An empty
/// zone falls back to `default_zone`.
pub fn parse_availability_zone(requested: Option<&str>, default_zone: Option<&str>) -> Result<AvailabilityZoneTarget> {
    let Some(requested) = requested.filter(|az| !az.is_empty()) else {
        return Ok(AvailabilityZoneTarget { zone: default_zone.map(str::to_string), ..Default::default() });
    };

    let parts: Vec<&str> = requested.split(':').collect();
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let target = match parts.as_slice() {
        [zone] => AvailabilityZoneTarget { zone: non_empty(zone), ..Default::default() },
        [zone, host] => {
            AvailabilityZoneTarget { zone: non_empty(zone), forced_host: non_empty(host).map(HostName::new), forced_node: None }
        }
        [zone, host, node] => AvailabilityZoneTarget {
            zone: non_empty(zone),
            forced_host: non_empty(host).map(HostName::new),
            forced_node: non_empty(node),
        },
        _ => return Err(Error::InvalidRequest(format!("Unable to parse availability_zone '{}'", requested))),
    };

    Ok(AvailabilityZoneTarget { zone: target.zone.clone().or_else(|| default_zone.map(str::to_string)), ..target })
}

/// Validated per-request template every new instance is cloned from.
struct BaseOptions {
    template: Instance,
    max_network_count: u32,
}

impl ComputeApi {
    /// Admits, records and hands over `max_count` (or as many as quota and
    /// network ports allow, at least `min_count`) new instances.
    ///
    /// The request is all-or-nothing: when any instance fails to be
    /// recorded, every record created so far is destroyed again and the
    /// request's quota reservation is rolled back.
    ///
    /// Returns the created instances and the reservation id shared by them.
    pub fn create(&self, ctx: &RequestContext, request: CreateRequest) -> Result<(Vec<Instance>, String)> {
        let min_count = request.min_count.unwrap_or(1);
        let mut max_count = request.max_count.unwrap_or(min_count);
        if min_count == 0 || max_count < min_count {
            return Err(Error::InvalidRequest(format!("Invalid instance count range {}-{}", min_count, max_count)));
        }

        if max_count > 1 {
            if let RequestedNetworks::Explicit(requests) = &request.requested_networks {
                if requests.iter().any(|r| r.address.is_some()) {
                    return Err(Error::InvalidRequest(
                        "max_count cannot be greater than 1 if a fixed_ip is specified".to_string(),
                    ));
                }
            }
        }

        let az = parse_availability_zone(request.availability_zone.as_deref(), self.config.default_schedule_zone.as_deref())?;
        let mut filter_properties = FilterProperties {
            scheduler_hints: request.scheduler_hints.clone(),
            force_hosts: az.forced_host.iter().cloned().collect(),
            force_nodes: az.forced_node.iter().cloned().collect(),
            ..Default::default()
        };

        let security_groups = if request.security_groups.is_empty() {
            vec![DEFAULT_SECURITY_GROUP.to_string()]
        } else {
            request.security_groups.clone()
        };

        let boot_meta = match &request.image_href {
            Some(image_id) => self.services.image_service.get(ctx, image_id)?,
            None => self.storage.bdm_image_metadata(ctx, &request.block_devices)?,
        };
        check_auto_disk_config(&boot_meta, request.auto_disk_config)?;

        let base = self.validate_and_build_base_options(ctx, &request, &boot_meta, &security_groups, &az, max_count)?;
        if base.max_network_count < min_count {
            return Err(Error::PortLimitExceeded);
        }
        if base.max_network_count < max_count {
            log::info!(
                "ComputeApi: max count reduced from {} to {} due to network port quota",
                max_count,
                base.max_network_count
            );
            max_count = base.max_network_count;
        }

        let topology = TopologyRequest {
            flavor: &request.flavor,
            image: &boot_meta,
            image_ref: request.image_href.as_ref(),
            root_device_name: base.template.root_device_name.as_deref(),
            min_count,
            max_count,
        };
        let block_device_mapping = self.storage.check_and_transform_bdm(&topology, request.block_devices.clone())?;

        self.checks_for_create_and_rebuild(
            ctx,
            request.image_href.as_ref(),
            &boot_meta,
            &request.flavor,
            &request.metadata,
            &request.injected_files,
            root_bdm(&block_device_mapping),
        )?;

        filter_properties.instance_group =
            request.scheduler_hints.get(SERVER_GROUP_HINT).map(|group| ServerGroupId::new(group.as_str()));

        let (instances, reservation) = self.provision_instances(
            ctx,
            &request,
            &base.template,
            &boot_meta,
            &block_device_mapping,
            filter_properties.instance_group.as_ref(),
            min_count,
            max_count,
        )?;

        for instance in &instances {
            record_action_start(ctx, instance, InstanceAction::Create);
        }

        let reservation_id = base.template.reservation_id.clone();
        log::info!(
            "ComputeApi: reservation {} admitted {} instance(s) for project {}",
            reservation_id,
            instances.len(),
            ctx.project_id
        );

        let handed_off = self.services.compute_task_api.submit(
            ctx,
            ConductorTask::BuildInstances {
                instances: instances.clone(),
                image: boot_meta,
                filter_properties,
                admin_password: request.admin_password.clone(),
                injected_files: request.injected_files.clone(),
                requested_networks: request.requested_networks.clone(),
                security_groups,
                block_device_mapping,
            },
        );
        if let Err(e) = handed_off {
            log::warn!("ComputeApi: build of reservation {} could not be handed off, cleaning up: {}", reservation_id, e);
            self.destroy_partial_creation(&instances);
            reservation.rollback();
            return Err(e);
        }

        reservation.commit()?;
        Ok((instances, reservation_id))
    }

    //---------------------
    // --- Base options ---

    fn validate_and_build_base_options(
        &self,
        ctx: &RequestContext,
        request: &CreateRequest,
        boot_meta: &ImageMeta,
        security_groups: &[String],
        az: &AvailabilityZoneTarget,
        max_count: u32,
    ) -> Result<BaseOptions> {
        let flavor = &request.flavor;
        if flavor.disabled {
            return Err(Error::not_found("Flavor", &flavor.flavorid));
        }

        if let Some(user_data) = &request.user_data {
            if user_data.len() > self.config.max_userdata_size {
                return Err(Error::InstanceUserDataTooLarge { length: user_data.len(), maxsize: self.config.max_userdata_size });
            }
            let compact: String = user_data.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD.decode(compact).map_err(|_| Error::InstanceUserDataMalformed)?;
        }

        self.check_requested_secgroups(ctx, security_groups)?;

        let max_network_count = if request.requested_networks.no_allocate() {
            max_count
        } else {
            self.services.network_service.validate_networks(ctx, &request.requested_networks, max_count)?
        };

        let (kernel_id, ramdisk_id) =
            self.handle_kernel_and_ramdisk(ctx, request.kernel_id.as_ref(), request.ramdisk_id.as_ref(), boot_meta)?;

        let config_drive = match request.config_drive.as_deref() {
            None | Some("") => false,
            Some(value) => strict_bool_from_string(value).ok_or_else(|| Error::ConfigDriveInvalidValue(value.to_string()))?,
        };

        let mut key_data = request.key_data.clone();
        if key_data.is_none() {
            if let Some(key_name) = &request.key_name {
                key_data = Some(self.services.key_pairs.get(&ctx.user_id, key_name)?.public_key);
            }
        }

        let root_device_name =
            prepend_dev(properties_root_device_name(boot_meta).as_deref().unwrap_or(DEFAULT_ROOT_DEV_NAME));

        let numa_topology = numa_constraints(flavor, boot_meta)?;
        let pci_requests = pci_requests(flavor)?;

        let mut template = Instance::new(InstanceId::new(""), ctx.project_id.clone(), ctx.user_id.clone(), flavor.clone());
        template.reservation_id = generate_uid("r");
        template.image_ref = request.image_href.clone();
        template.kernel_id = kernel_id;
        template.ramdisk_id = ramdisk_id;
        template.display_name = request.display_name.clone().unwrap_or_default();
        template.display_description = request.display_description.clone();
        template.user_data = request.user_data.clone();
        template.key_name = request.key_name.clone();
        template.key_data = key_data;
        template.config_drive = config_drive;
        template.access_ip_v4 = request.access_ip_v4.clone();
        template.access_ip_v6 = request.access_ip_v6.clone();
        template.availability_zone = az.zone.clone();
        template.root_device_name = Some(root_device_name);
        template.shutdown_terminate = request.shutdown_terminate;
        template.metadata = request.metadata.clone();
        template.numa_topology = numa_topology;
        template.pci_requests = pci_requests;
        inherit_properties_from_image(&mut template, boot_meta, request.auto_disk_config);

        Ok(BaseOptions { template, max_network_count })
    }

    fn check_requested_secgroups(&self, ctx: &RequestContext, security_groups: &[String]) -> Result<()> {
        for name in security_groups.iter().filter(|name| name.as_str() != DEFAULT_SECURITY_GROUP) {
            if self.services.security_groups.get(ctx, name)?.is_none() {
                return Err(Error::SecurityGroupNotFoundForProject {
                    project_id: ctx.project_id.clone(),
                    security_group: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Kernel and ramdisk default to the image's; the null kernel clears both.
    pub(crate) fn handle_kernel_and_ramdisk(
        &self,
        ctx: &RequestContext,
        kernel_id: Option<&ImageId>,
        ramdisk_id: Option<&ImageId>,
        image: &ImageMeta,
    ) -> Result<(Option<ImageId>, Option<ImageId>)> {
        let mut kernel_id = kernel_id.cloned().or_else(|| image.property_str("kernel_id").map(ImageId::new));
        let mut ramdisk_id = ramdisk_id.cloned().or_else(|| image.property_str("ramdisk_id").map(ImageId::new));

        if kernel_id.as_ref().is_some_and(|k| k.as_str() == self.config.null_kernel) {
            kernel_id = None;
            ramdisk_id = None;
        }

        for image_id in kernel_id.iter().chain(ramdisk_id.iter()) {
            self.services.image_service.get(ctx, image_id)?;
        }
        Ok((kernel_id, ramdisk_id))
    }

    //---------------------
    // --- Checks shared with rebuild ---

    pub(crate) fn checks_for_create_and_rebuild(
        &self,
        ctx: &RequestContext,
        image_id: Option<&ImageId>,
        image: &ImageMeta,
        flavor: &Flavor,
        metadata: &BTreeMap<String, String>,
        injected_files: &[(String, String)],
        root_bdm: Option<&BlockDeviceMapping>,
    ) -> Result<()> {
        self.check_metadata_properties_quota(ctx, metadata)?;
        self.check_injected_file_quota(ctx, injected_files)?;
        check_requested_image(image_id, image, flavor, root_bdm)
    }

    //---------------------
    // --- Provisioning ---

    /// Records every admitted instance. The returned reservation is still
    /// pending until the build has been handed off.
    #[allow(clippy::too_many_arguments)]
    fn provision_instances(
        &self,
        ctx: &RequestContext,
        request: &CreateRequest,
        template: &Instance,
        boot_meta: &ImageMeta,
        block_device_mapping: &[BlockDeviceMapping],
        instance_group: Option<&ServerGroupId>,
        min_count: u32,
        max_count: u32,
    ) -> Result<(Vec<Instance>, QuotaReservation)> {
        let (num_instances, reservation) = self.check_num_instances_quota(ctx, &request.flavor, min_count, max_count)?;
        let security_groups =
            if request.security_groups.is_empty() { vec![DEFAULT_SECURITY_GROUP.to_string()] } else { request.security_groups.clone() };

        let mut created: Vec<Instance> = Vec::with_capacity(num_instances as usize);
        let outcome = self.services.security_groups.ensure_default(ctx).and_then(|()| {
            (0..num_instances).try_for_each(|index| {
                self.provision_one(
                    ctx,
                    request,
                    template,
                    boot_meta,
                    &security_groups,
                    block_device_mapping,
                    instance_group,
                    index,
                    num_instances,
                    &mut created,
                )
            })
        });

        if let Err(e) = outcome {
            log::warn!("ComputeApi: creation of reservation {} failed, cleaning up: {}", template.reservation_id, e);
            self.destroy_partial_creation(&created);
            reservation.rollback();
            return Err(e);
        }

        Ok((created, reservation))
    }

    /// Records one instance. It joins `created` as soon as its durable record
    /// exists, so a later failure cleans it up along with the others.
    #[allow(clippy::too_many_arguments)]
    fn provision_one(
        &self,
        ctx: &RequestContext,
        request: &CreateRequest,
        template: &Instance,
        boot_meta: &ImageMeta,
        security_groups: &[String],
        block_device_mapping: &[BlockDeviceMapping],
        instance_group: Option<&ServerGroupId>,
        index: u32,
        num_instances: u32,
        created: &mut Vec<Instance>,
    ) -> Result<()> {
        let mut instance = template.clone();
        instance.uuid = InstanceId::generate();
        self.populate_instance_for_create(&mut instance, boot_meta, security_groups, index, num_instances);

        let bdms = self.storage.validate_for_instance(ctx, &instance, &request.flavor, block_device_mapping)?;

        let store = self.resolver.store();
        store.create_build_request(BuildRequest::new(instance.clone(), bdms.clone()))?;
        if let Err(e) = store.create_instance_mapping(InstanceMapping::pending(instance.uuid.clone(), instance.project_id.clone())) {
            ignore_cleanup_failure("build request", &instance.uuid, store.destroy_build_request(&instance.uuid));
            return Err(e);
        }
        if let Err(e) = store.default_cell().create_instance(&instance) {
            ignore_cleanup_failure("build request", &instance.uuid, store.destroy_build_request(&instance.uuid));
            ignore_cleanup_failure("instance mapping", &instance.uuid, store.destroy_instance_mapping(&instance.uuid));
            return Err(e);
        }
        created.push(instance.clone());

        for bdm in bdms.into_iter().filter(|bdm| bdm.volume_size != Some(0)) {
            store.default_cell().create_bdm(&instance.uuid, bdm);
        }

        if let Some(group_id) = instance_group {
            self.join_server_group(ctx, request, group_id, &instance)?;
        }

        send_update(ctx, &instance);
        Ok(())
    }

    fn join_server_group(
        &self,
        ctx: &RequestContext,
        request: &CreateRequest,
        group_id: &ServerGroupId,
        instance: &Instance,
    ) -> Result<()> {
        if request.check_server_group_quota {
            let members = self.services.server_groups.count_members_by_user(group_id, &ctx.user_id)? + 1;
            let values: QuotaDeltas = [(QuotaResource::ServerGroupMembers, members)].into_iter().collect();
            if let Err(e) = self.quota.limit_check(&ctx.project_id, &values) {
                return match e {
                    Error::OverQuota(_) => Err(Error::ServerGroupMembersExceeded),
                    other => Err(other),
                };
            }
        }
        self.services.server_groups.add_members(group_id, &ctx.user_id, std::slice::from_ref(&instance.uuid))
    }

    /// Best-effort removal of everything a failed request already recorded.
    fn destroy_partial_creation(&self, created: &[Instance]) {
        let store = self.resolver.store();
        for instance in created {
            ignore_cleanup_failure("instance", &instance.uuid, store.default_cell().destroy_instance(&instance.uuid));
            ignore_cleanup_failure("instance mapping", &instance.uuid, store.destroy_instance_mapping(&instance.uuid));
            ignore_cleanup_failure("build request", &instance.uuid, store.destroy_build_request(&instance.uuid));
        }
    }

    fn populate_instance_for_create(
        &self,
        instance: &mut Instance,
        image: &ImageMeta,
        security_groups: &[String],
        index: u32,
        num_instances: u32,
    ) {
        instance.launch_index = index;
        instance.vm_state = VmState::Building;
        instance.task_state = Some(TaskState::Scheduling);
        instance.old_flavor = None;
        instance.new_flavor = None;
        instance.security_groups = security_groups.to_vec();

        instance.system_metadata = system_metadata_from_image(image);
        let base_image_ref = instance.image_ref.as_ref().map(ImageId::to_string).unwrap_or_default();
        instance.system_metadata.entry("image_base_image_ref".to_string()).or_insert(base_image_ref);

        self.apply_instance_name(instance, index, num_instances);
    }

    fn apply_instance_name(&self, instance: &mut Instance, index: u32, num_instances: u32) {
        let default_hostname = format!("Server-{}", instance.uuid);
        if instance.display_name.is_empty() {
            instance.display_name = format!("Server {}", instance.uuid);
        }

        let original_hostname = sanitize_hostname(&instance.display_name);
        if num_instances > 1 && self.config.cell_type != Some(CellType::Api) {
            instance.display_name = self
                .config
                .multi_instance_display_name_template
                .replace("{name}", &instance.display_name)
                .replace("{count}", &(index + 1).to_string())
                .replace("{uuid}", instance.uuid.as_str());
            instance.hostname =
                if original_hostname.is_empty() { default_hostname } else { sanitize_hostname(&instance.display_name) };
        } else {
            instance.hostname = if original_hostname.is_empty() { default_hostname } else { original_hostname };
        }
    }
}

fn ignore_cleanup_failure(what: &str, instance_uuid: &InstanceId, result: Result<()>) {
    if let Err(e) = result {
        log::debug!("ComputeApi {}: {} already gone during cleanup: {}", instance_uuid, what, e);
    }
}

/// `image_`-prefixed copy of the image's properties plus its size limits.
pub fn system_metadata_from_image(image: &ImageMeta) -> BTreeMap<String, String> {
    let mut system_metadata: BTreeMap<String, String> = image
        .properties
        .keys()
        .filter_map(|key| image.property_str(key).map(|value| (format!("image_{}", key), value)))
        .collect();
    system_metadata.insert("image_min_ram".to_string(), image.min_ram.to_string());
    system_metadata.insert("image_min_disk".to_string(), image.min_disk.to_string());
    system_metadata
}

fn image_disables_auto_disk_config(image: &ImageMeta) -> bool {
    image.property_str("auto_disk_config").is_some_and(|v| v.eq_ignore_ascii_case("disabled"))
}

/// Requesting auto disk config from an image that disables it fails.
pub(crate) fn check_auto_disk_config(image: &ImageMeta, auto_disk_config: Option<bool>) -> Result<()> {
    if auto_disk_config == Some(true) && image_disables_auto_disk_config(image) {
        return Err(Error::AutoDiskConfigDisabledByImage(image.id.clone().unwrap_or_else(|| ImageId::new(""))));
    }
    Ok(())
}

pub(crate) fn inherit_properties_from_image(instance: &mut Instance, image: &ImageMeta, auto_disk_config: Option<bool>) {
    instance.os_type = image.property_str("os_type");
    instance.architecture = image.property_str("architecture");
    instance.vm_mode = image.property_str("vm_mode");
    instance.auto_disk_config = match auto_disk_config {
        Some(requested) => requested,
        None if image_disables_auto_disk_config(image) => false,
        None => image.property_bool("auto_disk_config").unwrap_or(false),
    };
}

/// Image status, config drive policy, memory and disk fit of `flavor`.
pub(crate) fn check_requested_image(
    image_id: Option<&ImageId>,
    image: &ImageMeta,
    flavor: &Flavor,
    root_bdm: Option<&BlockDeviceMapping>,
) -> Result<()> {
    if image_id.is_none() && image.status.is_empty() {
        return Ok(());
    }

    if image.status != IMAGE_STATUS_ACTIVE {
        return Err(Error::ImageNotActive(image_id.cloned().or_else(|| image.id.clone()).unwrap_or_else(|| ImageId::new(""))));
    }

    if let Some(policy) = image.property_str("img_config_drive") {
        if policy != "optional" && policy != "mandatory" {
            return Err(Error::InvalidImageConfigDrive(policy));
        }
    }

    if flavor.memory_mb < image.min_ram {
        return Err(Error::FlavorMemoryTooSmall);
    }

    let image_min_disk = image.min_disk * GIB;
    let root_volume =
        root_bdm.filter(|bdm| bdm.destination_type == Some(DestinationType::Volume) || bdm.source_type == SourceType::Volume);

    // A volume root is never checked against the flavor disk; an existing
    // volume of unknown size is not checked at all.
    if let Some(root_volume) = root_volume {
        if let Some(volume_size) = root_volume.volume_size {
            let volume_size = volume_size * GIB;
            if image_min_disk > volume_size {
                return Err(Error::VolumeSmallerThanMinDisk { volume_size, image_min_disk });
            }
        }
        return Ok(());
    }

    let dest_size = flavor.root_gb * GIB;
    if dest_size != 0 {
        if image.size > dest_size {
            return Err(Error::FlavorDiskSmallerThanImage { flavor_size: dest_size, image_size: image.size });
        }
        if image_min_disk > dest_size {
            return Err(Error::FlavorDiskSmallerThanMinDisk { flavor_size: dest_size, image_min_disk });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_zone_forms() {
        let az = parse_availability_zone(Some("zone-a:host1"), None).unwrap();
        assert_eq!((az.zone.as_deref(), az.forced_host.as_ref().map(|h| h.as_str()), az.forced_node), (Some("zone-a"), Some("host1"), None));

        let az = parse_availability_zone(Some("zone-a::node1"), None).unwrap();
        assert_eq!((az.forced_host, az.forced_node.as_deref()), (None, Some("node1")));

        let az = parse_availability_zone(Some("zone-a:h:n"), None).unwrap();
        assert_eq!((az.forced_host.map(|h| h.to_string()), az.forced_node.as_deref()), (Some("h".to_string()), Some("n")));

        assert!(matches!(parse_availability_zone(Some("a:b:c:d"), None), Err(Error::InvalidRequest(_))));
        assert_eq!(parse_availability_zone(None, Some("zone-a")).unwrap().zone.as_deref(), Some("zone-a"));
    }

    #[test]
    fn inactive_image_is_rejected() {
        let mut image = ImageMeta::active("img");
        image.status = "queued".to_string();
        let err = check_requested_image(Some(&ImageId::new("img")), &image, &Flavor::new("f", 1, 512, 1), None).unwrap_err();
        assert!(matches!(err, Error::ImageNotActive(_)));
    }

    #[test]
    fn disk_checks_against_flavor_and_volume() {
        let flavor = Flavor::new("f", 1, 512, 1);
        let mut image = ImageMeta::active("img");
        image.min_disk = 2;
        let id = ImageId::new("img");

        assert!(matches!(
            check_requested_image(Some(&id), &image, &flavor, None),
            Err(Error::FlavorDiskSmallerThanMinDisk { .. })
        ));

        let small_volume = BlockDeviceMapping::image_to_volume(id.clone(), Some(1)).with_boot_index(0);
        assert!(matches!(
            check_requested_image(Some(&id), &image, &flavor, Some(&small_volume)),
            Err(Error::VolumeSmallerThanMinDisk { .. })
        ));

        let zero_disk = Flavor::new("f0", 1, 512, 0);
        assert!(check_requested_image(Some(&id), &image, &zero_disk, None).is_ok());
    }

    #[test]
    fn memory_and_config_drive_policy() {
        let id = ImageId::new("img");
        let mut image = ImageMeta::active("img");
        image.min_ram = 1024;
        assert!(matches!(
            check_requested_image(Some(&id), &image, &Flavor::new("f", 1, 512, 0), None),
            Err(Error::FlavorMemoryTooSmall)
        ));

        let image = ImageMeta::active("img").with_property("img_config_drive", "sometimes");
        assert!(matches!(
            check_requested_image(Some(&id), &image, &Flavor::new("f", 1, 512, 0), None),
            Err(Error::InvalidImageConfigDrive(_))
        ));
    }

    #[test]
    fn auto_disk_config_disabled_by_image() {
        let image = ImageMeta::active("img").with_property("auto_disk_config", "Disabled");
        assert!(matches!(check_auto_disk_config(&image, Some(true)), Err(Error::AutoDiskConfigDisabledByImage(_))));
        assert!(check_auto_disk_config(&image, Some(false)).is_ok());
        assert!(check_auto_disk_config(&image, None).is_ok());
    }

    #[test]
    fn image_properties_land_in_system_metadata() {
        let image = ImageMeta::active("img").with_property("os_distro", "debian");
        let sysmeta = system_metadata_from_image(&image);
        assert_eq!(sysmeta.get("image_os_distro").map(String::as_str), Some("debian"));
        assert_eq!(sysmeta.get("image_min_ram").map(String::as_str), Some("0"));
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use crate::api::block_device_dto::{BlockDeviceDto, ImageMappingDto, LegacyBlockDeviceDto};
use crate::domain::block_device::legacy::{LegacyBlockDevice, from_legacy_mapping, is_swap_or_ephemeral};
use crate::domain::block_device::mapping::{
    BlockDeviceMapping, DEFAULT_ROOT_DEV_NAME, DestinationType, SWAP_GUEST_FORMAT, SourceType, root_bdm, strip_dev,
};
use crate::domain::config::ComputeConfig;
use crate::domain::context::RequestContext;
use crate::domain::instance::flavor::Flavor;
use crate::domain::instance::instance::Instance;
use crate::domain::services::image::{IMAGE_STATUS_ACTIVE, ImageMeta, ImageService};
use crate::domain::services::volume::{Volume, VolumeService};
use crate::domain::utils::id::{ImageId, VolumeId};
use crate::error::{Error, Result};

const GIB: i64 = 1024 * 1024 * 1024;

/// Devices as the caller declared them.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDeviceRequest {
    Legacy(Vec<LegacyBlockDevice>),
    Current(Vec<BlockDeviceMapping>),
}

/// An empty legacy list, so an image boot gets its local root device.
impl Default for BlockDeviceRequest {
    fn default() -> Self {
        BlockDeviceRequest::Legacy(Vec::new())
    }
}

impl BlockDeviceRequest {
    pub fn is_empty(&self) -> bool {
        match self {
            BlockDeviceRequest::Legacy(devices) => devices.is_empty(),
            BlockDeviceRequest::Current(devices) => devices.is_empty(),
        }
    }
}

/// Inputs of one device-list resolution.
#[derive(Debug, Clone, Copy)]
pub struct TopologyRequest<'a> {
    pub flavor: &'a Flavor,
    pub image: &'a ImageMeta,
    pub image_ref: Option<&'a ImageId>,
    pub root_device_name: Option<&'a str>,
    pub min_count: u32,
    pub max_count: u32,
}

/// Root device name declared by image properties: `root_device_name`, or
/// the `root` entry of `mappings`.
pub fn properties_root_device_name(image: &ImageMeta) -> Option<String> {
    if let Some(name) = image.property_str("root_device_name") {
        return Some(name);
    }
    image_mappings(image).ok()?.into_iter().rev().find(|m| m.virtual_name == "root").map(|m| m.device)
}

fn image_mappings(image: &ImageMeta) -> Result<Vec<ImageMappingDto>> {
    match image.property("mappings") {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(Vec::new()),
    }
}

/// Size of a device; blank local devices without one inherit the flavor's
/// swap or ephemeral size.
pub fn volume_size(flavor: &Flavor, bdm: &BlockDeviceMapping) -> Option<i64> {
    if bdm.volume_size.is_none() && bdm.source_type == SourceType::Blank && bdm.is_local() {
        if bdm.guest_format.as_deref() == Some(SWAP_GUEST_FORMAT) {
            return Some(flavor.swap);
        }
        return Some(flavor.ephemeral_gb);
    }
    bdm.volume_size
}

/// Overrides entries of `overridable` by device name with those of `overrider`.
pub fn merge_bdms_lists(overridable: Vec<BlockDeviceMapping>, overrider: Vec<BlockDeviceMapping>) -> Vec<BlockDeviceMapping> {
    let names: HashSet<String> = overrider.iter().filter_map(|bdm| bdm.device_name.clone()).collect();
    let mut merged = overrider;
    merged.extend(overridable.into_iter().filter(|bdm| bdm.device_name.as_ref().is_none_or(|name| !names.contains(name))));
    merged
}

/// Blank ephemeral and swap devices implied by the flavor and not already present.
pub fn flavor_defined_bdms(flavor: &Flavor, bdms: &[BlockDeviceMapping]) -> Vec<BlockDeviceMapping> {
    let mut implied = Vec::new();
    if flavor.ephemeral_gb > 0 && !bdms.iter().any(BlockDeviceMapping::is_ephemeral) {
        implied.push(BlockDeviceMapping::ephemeral(Some(flavor.ephemeral_gb), None));
    }
    if flavor.swap > 0 && !bdms.iter().any(BlockDeviceMapping::is_swap) {
        implied.push(BlockDeviceMapping::swap(Some(flavor.swap)));
    }
    implied
}

/// Boot indices of bootable devices must start at 0 and be contiguous once sorted.
pub fn check_boot_sequence(bdms: &[BlockDeviceMapping]) -> Result<()> {
    let mut boot_indexes: Vec<i32> = bdms.iter().filter_map(|bdm| bdm.boot_index.filter(|i| *i >= 0)).collect();
    boot_indexes.sort_unstable();

    let contiguous = boot_indexes.windows(2).all(|pair| pair[0].checked_add(1) == Some(pair[1]));
    if boot_indexes.first() != Some(&0) || !contiguous {
        log::debug!("StorageTopology: invalid boot sequence {:?}", boot_indexes);
        return Err(Error::InvalidBdmBootSequence);
    }
    Ok(())
}

/// Drive letter of a legacy device name: `/dev/vdb1` -> `b`.
fn device_letter(device_name: &str) -> &str {
    let name = strip_dev(device_name);
    let name = ["xvd", "vd", "sd", "hd"].iter().find_map(|prefix| name.strip_prefix(prefix)).unwrap_or(name);
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Image-like metadata carried by a bootable volume.
fn image_meta_from_volume(volume: &Volume) -> ImageMeta {
    let mut meta = ImageMeta {
        status: IMAGE_STATUS_ACTIVE.to_string(),
        size: volume.size * GIB,
        ..Default::default()
    };
    for (key, value) in &volume.volume_image_metadata {
        match key.as_str() {
            "min_ram" => meta.min_ram = value.parse().unwrap_or(0),
            "min_disk" => meta.min_disk = value.parse().unwrap_or(0),
            "image_id" | "image_name" | "size" | "checksum" | "container_format" | "disk_format" => {}
            _ => {
                meta.properties.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
        }
    }
    meta
}

/// Merges, normalizes and validates the storage devices of new instances.
#[derive(Debug, Clone)]
pub struct StorageTopologyResolver {
    image_service: Arc<dyn ImageService>,
    volume_service: Arc<dyn VolumeService>,
    max_local_block_devices: i64,
    default_ephemeral_format: Option<String>,
}

impl StorageTopologyResolver {
    pub fn new(image_service: Arc<dyn ImageService>, volume_service: Arc<dyn VolumeService>, config: &ComputeConfig) -> Self {
        Self {
            image_service,
            volume_service,
            max_local_block_devices: config.max_local_block_devices,
            default_ephemeral_format: config.default_ephemeral_format.clone(),
        }
    }

    fn default_ephemeral_format(&self) -> Option<&str> {
        self.default_ephemeral_format.as_deref()
    }

    //---------------------
    // --- Normalization ---

    /// Blank swap/ephemeral devices declared in the image `mappings` property.
    pub fn prepare_image_mapping(&self, flavor: &Flavor, mappings: &[ImageMappingDto]) -> Vec<BlockDeviceMapping> {
        let mut prepared = Vec::new();
        for mapping in mappings {
            let virtual_name = mapping.virtual_name.as_str();
            if virtual_name == "ami" || virtual_name == "root" || !is_swap_or_ephemeral(virtual_name) {
                continue;
            }
            log::debug!("StorageTopology: image bdm {} -> {}", virtual_name, mapping.device);

            let guest_format = if virtual_name == "swap" {
                Some(SWAP_GUEST_FORMAT.to_string())
            } else {
                mapping.guest_format.clone().or_else(|| self.default_ephemeral_format.clone())
            };

            let device = if mapping.device.starts_with('/') { mapping.device.clone() } else { format!("/dev/{}", mapping.device) };
            let mut bdm = BlockDeviceMapping::ephemeral(None, guest_format).with_device_name(device);
            bdm.device_type = Some("disk".to_string());
            bdm.volume_size = volume_size(flavor, &bdm);
            if bdm.volume_size == Some(0) {
                continue;
            }
            prepared.push(bdm);
        }
        prepared
    }

    /// Devices the image declares through `block_device_mapping` and `mappings`.
    pub fn image_defined_bdms(&self, flavor: &Flavor, image: &ImageMeta, root_device_name: &str) -> Result<Vec<BlockDeviceMapping>> {
        let legacy_format = !image.property_bool("bdm_v2").unwrap_or(false);
        let declared = image.property("block_device_mapping").cloned().unwrap_or(serde_json::Value::Array(Vec::new()));

        let mut bdms = if legacy_format {
            let legacy: Vec<LegacyBlockDeviceDto> = serde_json::from_value(declared)?;
            let legacy: Vec<LegacyBlockDevice> = legacy.into_iter().map(LegacyBlockDevice::from).collect();
            from_legacy_mapping(&legacy, None, Some(root_device_name), false, self.default_ephemeral_format())?
        } else {
            let dtos: Vec<BlockDeviceDto> = serde_json::from_value(declared)?;
            dtos.into_iter().map(BlockDeviceMapping::try_from).collect::<Result<Vec<_>>>()?
        };

        let mappings = image_mappings(image)?;
        if !mappings.is_empty() {
            let prepared = self.prepare_image_mapping(flavor, &mappings);
            bdms = merge_bdms_lists(prepared, bdms);
        }
        Ok(bdms)
    }

    /// Builds the final device list of a creation request from the caller's
    /// devices, the image's and the flavor's.
    pub fn check_and_transform_bdm(&self, request: &TopologyRequest<'_>, devices: BlockDeviceRequest) -> Result<Vec<BlockDeviceMapping>> {
        let root_device_name = request.root_device_name.unwrap_or(DEFAULT_ROOT_DEV_NAME);

        if request.image_ref.is_some() {
            if let BlockDeviceRequest::Current(bdms) = &devices {
                let collides = bdms.iter().any(|bdm| {
                    bdm.destination_type == Some(DestinationType::Volume)
                        && bdm.device_name.as_deref().map(strip_dev) == Some(strip_dev(root_device_name))
                });
                if collides {
                    return Err(Error::InvalidRequest(format!(
                        "The volume cannot be assigned the same device name as the root device {}",
                        root_device_name
                    )));
                }
            }
        }

        let image_defined = self.image_defined_bdms(request.flavor, request.image, root_device_name)?;
        let root_in_image_bdms = root_bdm(&image_defined).is_some();

        let requested = match devices {
            BlockDeviceRequest::Legacy(legacy) => from_legacy_mapping(
                &legacy,
                request.image_ref,
                Some(root_device_name),
                root_in_image_bdms,
                self.default_ephemeral_format(),
            )?,
            BlockDeviceRequest::Current(bdms) if root_in_image_bdms => {
                bdms.into_iter().filter(|bdm| !(bdm.is_root() && bdm.source_type == SourceType::Image)).collect()
            }
            BlockDeviceRequest::Current(bdms) => bdms,
        };

        let mut merged = merge_bdms_lists(image_defined, requested);

        if (request.min_count > 1 || request.max_count > 1) && merged.iter().any(|bdm| bdm.source_type == SourceType::Volume) {
            return Err(Error::InvalidRequest("Cannot attach one or more volumes to multiple instances".to_string()));
        }

        let implied = flavor_defined_bdms(request.flavor, &merged);
        merged.extend(implied);
        Ok(merged)
    }

    //---------------------
    // --- Validation ---

    /// Validates a device list for `instance`, filling in volume and snapshot sizes.
    pub fn validate_bdm(&self, ctx: &RequestContext, instance: &Instance, flavor: &Flavor, bdms: &mut [BlockDeviceMapping]) -> Result<()> {
        check_boot_sequence(bdms)?;

        for bdm in bdms.iter_mut() {
            if let Some(image_id) = bdm.image_id.clone().filter(|id| Some(id) != instance.image_ref.as_ref()) {
                self.image_service.get(ctx, &image_id).map_err(|_| Error::InvalidBdmImage(image_id.clone()))?;
                if bdm.source_type == SourceType::Image && bdm.is_volume() && bdm.volume_size.unwrap_or(0) == 0 {
                    return Err(Error::InvalidBdm(
                        "Images with destination_type 'volume' need to have a non-zero size specified".to_string(),
                    ));
                }
            } else if let Some(volume_id) = bdm.volume_id.clone() {
                let volume = self.attachable_volume(ctx, &volume_id)?;
                bdm.volume_size = Some(volume.size);
            } else if let Some(snapshot_id) = bdm.snapshot_id.clone() {
                let snapshot = self.volume_service.get_snapshot(ctx, &snapshot_id).map_err(|e| match e {
                    e @ Error::ExternalService { .. } => e,
                    _ => Error::InvalidBdmSnapshot(snapshot_id.clone()),
                })?;
                bdm.volume_size = bdm.volume_size.or(Some(snapshot.size));
            } else if bdm.source_type == SourceType::Blank && bdm.is_volume() && bdm.volume_size.unwrap_or(0) == 0 {
                return Err(Error::InvalidBdm(
                    "Blank volumes (source: 'blank', dest: 'volume') need to have non-zero size".to_string(),
                ));
            }
        }

        let ephemeral_size: i64 =
            bdms.iter().filter(|bdm| bdm.is_ephemeral()).map(|bdm| bdm.volume_size.unwrap_or(flavor.ephemeral_gb)).sum();
        if ephemeral_size > flavor.ephemeral_gb {
            return Err(Error::InvalidBdmEphemeralSize);
        }

        let swaps: Vec<&BlockDeviceMapping> = bdms.iter().filter(|bdm| bdm.is_swap()).collect();
        if swaps.len() > 1 {
            return Err(Error::InvalidBdmFormat("More than one swap drive requested.".to_string()));
        }
        if let Some(swap) = swaps.first() {
            if swap.volume_size.unwrap_or(0) > flavor.swap {
                return Err(Error::InvalidBdmSwapSize);
            }
        }

        if self.max_local_block_devices >= 0 {
            let local = bdms.iter().filter(|bdm| bdm.is_local()).count();
            if local as i64 > self.max_local_block_devices {
                return Err(Error::InvalidBdmLocalsLimit);
            }
        }
        Ok(())
    }

    fn attachable_volume(&self, ctx: &RequestContext, volume_id: &VolumeId) -> Result<Volume> {
        let volume = self.volume_service.get(ctx, volume_id).map_err(|e| match e {
            e @ Error::ExternalService { .. } => e,
            other => Error::InvalidBdmVolume { volume_id: volume_id.clone(), reason: other.to_string() },
        })?;
        self.volume_service.check_attach(ctx, &volume)?;
        Ok(volume)
    }

    /// Validates the list and returns the copy persisted for `instance`.
    pub fn validate_for_instance(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        flavor: &Flavor,
        bdms: &[BlockDeviceMapping],
    ) -> Result<Vec<BlockDeviceMapping>> {
        let mut validated = bdms.to_vec();
        self.validate_bdm(ctx, instance, flavor, &mut validated)?;
        for bdm in &mut validated {
            bdm.volume_size = volume_size(flavor, bdm);
            bdm.instance_uuid = Some(instance.uuid.clone());
        }
        Ok(validated)
    }

    //---------------------
    // --- Boot metadata ---

    /// Boot metadata of a volume-backed request: taken from the device at
    /// boot index 0 (drive letter `a` for legacy lists).
    pub fn bdm_image_metadata(&self, ctx: &RequestContext, devices: &BlockDeviceRequest) -> Result<ImageMeta> {
        let root = match devices {
            BlockDeviceRequest::Legacy(legacy) => legacy
                .iter()
                .find(|d| device_letter(d.device_name.as_deref().unwrap_or("")) == "a")
                .map(|d| (None, d.volume_id.clone(), d.snapshot_id.clone())),
            BlockDeviceRequest::Current(bdms) => {
                bdms.iter().find(|bdm| bdm.is_root()).map(|bdm| (bdm.image_id.clone(), bdm.volume_id.clone(), bdm.snapshot_id.clone()))
            }
        };
        let Some((image_id, mut volume_id, snapshot_id)) = root else {
            return Ok(ImageMeta::default());
        };

        if let Some(snapshot_id) = snapshot_id {
            let snapshot = self.volume_service.get_snapshot(ctx, &snapshot_id)?;
            volume_id = Some(snapshot.volume_id);
        }

        if let Some(image_id) = image_id {
            return self.image_service.get(ctx, &image_id).map_err(|_| Error::InvalidBdmImage(image_id));
        }
        if let Some(volume_id) = volume_id {
            let volume = self.volume_service.get(ctx, &volume_id).map_err(|e| match e {
                e @ Error::ExternalService { .. } => e,
                other => Error::InvalidBdmVolume { volume_id: volume_id.clone(), reason: other.to_string() },
            })?;
            if !volume.bootable {
                return Err(Error::InvalidBdmVolumeNotBootable(volume_id));
            }
            return Ok(image_meta_from_volume(&volume));
        }
        Ok(ImageMeta::default())
    }
}

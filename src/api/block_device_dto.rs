use serde::{Deserialize, Serialize};

use crate::domain::block_device::legacy::LegacyBlockDevice;
use crate::domain::block_device::mapping::{BlockDeviceMapping, DestinationType, SourceType};
use crate::domain::utils::id::{ImageId, SnapshotId, VolumeId};
use crate::error::{Error, Result};

/// Device mapping as stored in image properties (`block_device_mapping` with `bdm_v2`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockDeviceDto {
    pub source_type: Option<String>,
    pub destination_type: Option<String>,
    pub boot_index: Option<i32>,
    pub device_name: Option<String>,
    pub volume_size: Option<i64>,
    pub delete_on_termination: Option<bool>,
    pub guest_format: Option<String>,
    pub device_type: Option<String>,
    pub disk_bus: Option<String>,
    pub image_id: Option<String>,
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub no_device: Option<bool>,
}

/// Legacy single-field mapping (`virtual_name`, `volume_id`, `snapshot_id`, `no_device`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LegacyBlockDeviceDto {
    pub device_name: Option<String>,
    pub virtual_name: Option<String>,
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub no_device: Option<bool>,
    pub volume_size: Option<i64>,
    pub delete_on_termination: Option<bool>,
}

/// One entry of the image `mappings` property.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageMappingDto {
    #[serde(rename = "virtual")]
    pub virtual_name: String,
    pub device: String,
    #[serde(default)]
    pub guest_format: Option<String>,
}

impl TryFrom<BlockDeviceDto> for BlockDeviceMapping {
    type Error = Error;

    fn try_from(dto: BlockDeviceDto) -> Result<Self> {
        let no_device = dto.no_device.unwrap_or(false);
        if no_device {
            let name = dto.device_name.ok_or_else(|| Error::InvalidBdmFormat("no_device entry without device_name".into()))?;
            return Ok(BlockDeviceMapping::no_device(name));
        }

        let source_type: SourceType =
            dto.source_type.as_deref().ok_or_else(|| Error::InvalidBdmFormat("Missing source_type field".into()))?.parse()?;
        let destination_type = dto.destination_type.as_deref().map(str::parse::<DestinationType>).transpose()?;

        let bdm = BlockDeviceMapping {
            instance_uuid: None,
            source_type,
            destination_type: destination_type.or(Some(DestinationType::Local)),
            boot_index: dto.boot_index,
            device_name: dto.device_name,
            volume_size: dto.volume_size,
            delete_on_termination: dto.delete_on_termination.unwrap_or(false),
            guest_format: dto.guest_format,
            device_type: dto.device_type,
            disk_bus: dto.disk_bus,
            image_id: dto.image_id.map(ImageId::new),
            volume_id: dto.volume_id.map(VolumeId::new),
            snapshot_id: dto.snapshot_id.map(SnapshotId::new),
            no_device: false,
            connection_info: None,
        };

        let missing_source_id = match bdm.source_type {
            SourceType::Image => bdm.image_id.is_none(),
            SourceType::Volume => bdm.volume_id.is_none(),
            SourceType::Snapshot => bdm.snapshot_id.is_none(),
            SourceType::Blank => false,
        };
        if missing_source_id {
            return Err(Error::InvalidBdmFormat(format!("Missing id for source_type {}", bdm.source_type)));
        }

        Ok(bdm)
    }
}

/// Image-mapping form of a device, as stored in snapshot properties.
impl From<&BlockDeviceMapping> for BlockDeviceDto {
    fn from(bdm: &BlockDeviceMapping) -> Self {
        BlockDeviceDto {
            source_type: Some(bdm.source_type.to_string()),
            destination_type: bdm.destination_type.map(|d| match d {
                DestinationType::Local => "local".to_string(),
                DestinationType::Volume => "volume".to_string(),
            }),
            boot_index: bdm.boot_index,
            device_name: bdm.device_name.clone(),
            volume_size: bdm.volume_size,
            delete_on_termination: Some(bdm.delete_on_termination),
            guest_format: bdm.guest_format.clone(),
            device_type: bdm.device_type.clone(),
            disk_bus: bdm.disk_bus.clone(),
            image_id: bdm.image_id.as_ref().map(|id| id.to_string()),
            volume_id: bdm.volume_id.as_ref().map(|id| id.to_string()),
            snapshot_id: bdm.snapshot_id.as_ref().map(|id| id.to_string()),
            no_device: bdm.no_device.then_some(true),
        }
    }
}

impl From<LegacyBlockDeviceDto> for LegacyBlockDevice {
    fn from(dto: LegacyBlockDeviceDto) -> Self {
        LegacyBlockDevice {
            device_name: dto.device_name,
            virtual_name: dto.virtual_name,
            volume_id: dto.volume_id.map(VolumeId::new),
            snapshot_id: dto.snapshot_id.map(SnapshotId::new),
            no_device: dto.no_device.unwrap_or(false),
            volume_size: dto.volume_size,
            delete_on_termination: dto.delete_on_termination.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_entry_converts() {
        let dto: BlockDeviceDto = serde_json::from_str(
            r#"{"source_type": "snapshot", "destination_type": "volume", "snapshot_id": "s1", "boot_index": 0}"#,
        )
        .unwrap();
        let bdm = BlockDeviceMapping::try_from(dto).unwrap();

        assert_eq!(bdm.source_type, SourceType::Snapshot);
        assert!(bdm.is_volume());
        assert!(bdm.is_root());
    }

    #[test]
    fn entry_without_source_id_is_rejected() {
        let dto: BlockDeviceDto = serde_json::from_str(r#"{"source_type": "volume"}"#).unwrap();
        assert!(matches!(BlockDeviceMapping::try_from(dto), Err(Error::InvalidBdmFormat(_))));
    }
}

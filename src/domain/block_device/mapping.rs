use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::utils::id::{ImageId, InstanceId, SnapshotId, VolumeId};
use crate::error::Error;

pub const DEFAULT_ROOT_DEV_NAME: &str = "vda";
pub const SWAP_GUEST_FORMAT: &str = "swap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Image,
    Volume,
    Snapshot,
    Blank,
}

impl FromStr for SourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(SourceType::Image),
            "volume" => Ok(SourceType::Volume),
            "snapshot" => Ok(SourceType::Snapshot),
            "blank" => Ok(SourceType::Blank),
            other => Err(Error::InvalidBdmFormat(format!("Invalid source_type field '{}'", other))),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceType::Image => "image",
            SourceType::Volume => "volume",
            SourceType::Snapshot => "snapshot",
            SourceType::Blank => "blank",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    Local,
    Volume,
}

impl FromStr for DestinationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(DestinationType::Local),
            "volume" => Ok(DestinationType::Volume),
            other => Err(Error::InvalidBdmFormat(format!("Invalid destination_type field '{}'", other))),
        }
    }
}

/// One storage device of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub instance_uuid: Option<InstanceId>,
    pub source_type: SourceType,
    pub destination_type: Option<DestinationType>,
    /// `Some(n >= 0)` for bootable devices; negative or absent otherwise.
    pub boot_index: Option<i32>,
    pub device_name: Option<String>,
    /// Size in GiB.
    pub volume_size: Option<i64>,
    pub delete_on_termination: bool,
    pub guest_format: Option<String>,
    pub device_type: Option<String>,
    pub disk_bus: Option<String>,
    pub image_id: Option<ImageId>,
    pub volume_id: Option<VolumeId>,
    pub snapshot_id: Option<SnapshotId>,
    pub no_device: bool,
    /// Connection details stashed by the host worker, as JSON.
    pub connection_info: Option<String>,
}

impl BlockDeviceMapping {
    fn blank_template(source_type: SourceType, destination_type: DestinationType) -> Self {
        Self {
            instance_uuid: None,
            source_type,
            destination_type: Some(destination_type),
            boot_index: None,
            device_name: None,
            volume_size: None,
            delete_on_termination: false,
            guest_format: None,
            device_type: None,
            disk_bus: None,
            image_id: None,
            volume_id: None,
            snapshot_id: None,
            no_device: false,
            connection_info: None,
        }
    }

    /// Local root disk built from an image.
    pub fn image_root(image_id: ImageId) -> Self {
        Self {
            image_id: Some(image_id),
            boot_index: Some(0),
            delete_on_termination: true,
            ..Self::blank_template(SourceType::Image, DestinationType::Local)
        }
    }

    pub fn image_to_volume(image_id: ImageId, volume_size: Option<i64>) -> Self {
        Self { image_id: Some(image_id), volume_size, ..Self::blank_template(SourceType::Image, DestinationType::Volume) }
    }

    pub fn volume(volume_id: VolumeId) -> Self {
        Self { volume_id: Some(volume_id), ..Self::blank_template(SourceType::Volume, DestinationType::Volume) }
    }

    pub fn snapshot(snapshot_id: SnapshotId) -> Self {
        Self { snapshot_id: Some(snapshot_id), ..Self::blank_template(SourceType::Snapshot, DestinationType::Volume) }
    }

    pub fn blank_volume(volume_size: Option<i64>) -> Self {
        Self { volume_size, ..Self::blank_template(SourceType::Blank, DestinationType::Volume) }
    }

    pub fn ephemeral(volume_size: Option<i64>, guest_format: Option<String>) -> Self {
        Self {
            volume_size,
            guest_format,
            boot_index: Some(-1),
            delete_on_termination: true,
            ..Self::blank_template(SourceType::Blank, DestinationType::Local)
        }
    }

    pub fn swap(volume_size: Option<i64>) -> Self {
        Self::ephemeral(volume_size, Some(SWAP_GUEST_FORMAT.to_string()))
    }

    pub fn no_device(device_name: impl Into<String>) -> Self {
        Self {
            device_name: Some(device_name.into()),
            no_device: true,
            destination_type: None,
            ..Self::blank_template(SourceType::Blank, DestinationType::Local)
        }
    }

    pub fn with_boot_index(mut self, boot_index: i32) -> Self {
        self.boot_index = Some(boot_index);
        self
    }

    pub fn with_device_name(mut self, device_name: impl Into<String>) -> Self {
        self.device_name = Some(device_name.into());
        self
    }

    pub fn with_size(mut self, volume_size: i64) -> Self {
        self.volume_size = Some(volume_size);
        self
    }

    pub fn with_delete_on_termination(mut self, delete: bool) -> Self {
        self.delete_on_termination = delete;
        self
    }

    pub fn is_volume(&self) -> bool {
        self.destination_type == Some(DestinationType::Volume)
    }

    pub fn is_local(&self) -> bool {
        self.destination_type == Some(DestinationType::Local)
    }

    pub fn is_root(&self) -> bool {
        self.boot_index == Some(0)
    }

    pub fn is_bootable(&self) -> bool {
        self.boot_index.is_some_and(|i| i >= 0)
    }

    pub fn is_swap(&self) -> bool {
        self.source_type == SourceType::Blank && self.is_local() && self.guest_format.as_deref() == Some(SWAP_GUEST_FORMAT)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.source_type == SourceType::Blank && self.is_local() && self.guest_format.as_deref() != Some(SWAP_GUEST_FORMAT)
    }

    /// Host the connection was made for, if the worker stashed a connector.
    pub fn connector_host(&self) -> Option<String> {
        let info: serde_json::Value = serde_json::from_str(self.connection_info.as_deref()?).ok()?;
        info.get("connector")?.get("host")?.as_str().map(str::to_string)
    }
}

/// `/dev/vda` -> `vda`.
pub fn strip_dev(device_name: &str) -> &str {
    device_name.strip_prefix("/dev/").unwrap_or(device_name)
}

/// `vda` -> `/dev/vda`.
pub fn prepend_dev(device_name: &str) -> String {
    format!("/dev/{}", strip_dev(device_name))
}

/// Accepts `/dev/<letters><digits>` device paths.
pub fn match_device(device_name: &str) -> bool {
    let Some(rest) = device_name.strip_prefix("/dev/") else {
        return false;
    };
    let letters = rest.chars().take_while(|c| c.is_ascii_lowercase()).count();
    letters > 0 && rest[letters..].chars().all(|c| c.is_ascii_digit())
}

pub fn root_bdm(bdms: &[BlockDeviceMapping]) -> Option<&BlockDeviceMapping> {
    bdms.iter().find(|bdm| bdm.is_root())
}

/// An instance without an image always boots from a volume; otherwise the
/// root device decides.
pub fn is_volume_backed(image_ref: Option<&ImageId>, bdms: &[BlockDeviceMapping]) -> bool {
    if image_ref.is_none() {
        return true;
    }
    root_bdm(bdms).is_some_and(|root| root.is_volume())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths_are_matched() {
        assert!(match_device("/dev/vdb"));
        assert!(match_device("/dev/xvda1"));
        assert!(!match_device("vdb"));
        assert!(!match_device("/dev/1vdb"));
        assert!(!match_device("/dev/vd-b"));
    }

    #[test]
    fn dev_prefix_helpers() {
        assert_eq!(strip_dev("/dev/vda"), "vda");
        assert_eq!(prepend_dev("vda"), "/dev/vda");
        assert_eq!(prepend_dev("/dev/vda"), "/dev/vda");
    }

    #[test]
    fn swap_and_ephemeral_are_distinguished() {
        assert!(BlockDeviceMapping::swap(Some(1)).is_swap());
        assert!(!BlockDeviceMapping::swap(Some(1)).is_ephemeral());
        assert!(BlockDeviceMapping::ephemeral(Some(1), None).is_ephemeral());
    }

    #[test]
    fn volume_backed_detection() {
        let image = ImageId::new("img");
        let volume_root = vec![BlockDeviceMapping::volume(VolumeId::new("v1")).with_boot_index(0)];
        let image_root = vec![BlockDeviceMapping::image_root(image.clone())];

        assert!(is_volume_backed(None, &[]));
        assert!(is_volume_backed(Some(&image), &volume_root));
        assert!(!is_volume_backed(Some(&image), &image_root));
    }

    #[test]
    fn connector_host_is_read_from_connection_info() {
        let mut bdm = BlockDeviceMapping::volume(VolumeId::new("v1"));
        bdm.connection_info = Some(r#"{"connector": {"host": "compute-1"}}"#.to_string());
        assert_eq!(bdm.connector_host().as_deref(), Some("compute-1"));
    }
}

use crate::domain::block_device::mapping::{BlockDeviceMapping, SourceType, strip_dev};
use crate::domain::utils::id::{ImageId, SnapshotId, VolumeId};
use crate::error::{Error, Result};

/// Device declaration in the legacy single-field format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyBlockDevice {
    pub device_name: Option<String>,
    /// `swap` or `ephemeralN`.
    pub virtual_name: Option<String>,
    pub volume_id: Option<VolumeId>,
    pub snapshot_id: Option<SnapshotId>,
    pub no_device: bool,
    pub volume_size: Option<i64>,
    pub delete_on_termination: bool,
}

/// `ephemeral0`, `ephemeral1`, ... (no leading zeros).
pub fn is_ephemeral_name(name: &str) -> bool {
    match name.strip_prefix("ephemeral") {
        Some(index) if !index.is_empty() => {
            index.chars().all(|c| c.is_ascii_digit()) && (index.len() == 1 || !index.starts_with('0'))
        }
        _ => false,
    }
}

pub fn is_swap_or_ephemeral(name: &str) -> bool {
    name == "swap" || is_ephemeral_name(name)
}

/// Converts one legacy entry. Boot index is left for the caller to decide.
pub fn from_legacy(legacy: &LegacyBlockDevice, default_ephemeral_format: Option<&str>) -> Result<BlockDeviceMapping> {
    let virtual_name = legacy.virtual_name.as_deref().filter(|name| is_swap_or_ephemeral(name));

    let mut bdm = if let Some(name) = virtual_name {
        if name == "swap" {
            BlockDeviceMapping::swap(legacy.volume_size)
        } else {
            BlockDeviceMapping::ephemeral(legacy.volume_size, default_ephemeral_format.map(str::to_string))
        }
    } else if let Some(snapshot_id) = &legacy.snapshot_id {
        let mut bdm = BlockDeviceMapping::snapshot(snapshot_id.clone());
        bdm.volume_id = legacy.volume_id.clone();
        bdm
    } else if let Some(volume_id) = &legacy.volume_id {
        BlockDeviceMapping::volume(volume_id.clone())
    } else if legacy.no_device {
        BlockDeviceMapping::no_device(legacy.device_name.clone().unwrap_or_default())
    } else {
        return Err(Error::InvalidBdmFormat("Unrecognized legacy format.".to_string()));
    };

    bdm.boot_index = None;
    bdm.device_name = legacy.device_name.clone();
    if !bdm.is_swap() && !bdm.is_ephemeral() {
        bdm.volume_size = legacy.volume_size;
        bdm.delete_on_termination = legacy.delete_on_termination;
    }
    Ok(bdm)
}

/// Converts a whole legacy list and decides which device boots.
///
/// With neither a root device name nor an image, the first non-blank device
/// boots. Otherwise the device whose name matches the root device boots; when
/// none does and an image is given, a local image root device is prepended.
pub fn from_legacy_mapping(
    legacy: &[LegacyBlockDevice],
    image_ref: Option<&ImageId>,
    root_device_name: Option<&str>,
    no_root: bool,
    default_ephemeral_format: Option<&str>,
) -> Result<Vec<BlockDeviceMapping>> {
    let mut bdms = legacy.iter().map(|l| from_legacy(l, default_ephemeral_format)).collect::<Result<Vec<_>>>()?;

    if no_root {
        for bdm in &mut bdms {
            bdm.boot_index = Some(-1);
        }
        return Ok(bdms);
    }

    let mut volume_backed = false;
    if root_device_name.is_none() && image_ref.is_none() {
        if let Some(first) = bdms.iter_mut().find(|bdm| bdm.source_type != SourceType::Blank) {
            first.boot_index = Some(0);
        }
    } else {
        for bdm in &mut bdms {
            let matches_root = matches!(bdm.source_type, SourceType::Volume | SourceType::Snapshot | SourceType::Image)
                && root_device_name.is_some_and(|root| bdm.device_name.as_deref().map(strip_dev) == Some(strip_dev(root)));
            if matches_root {
                bdm.boot_index = Some(0);
                volume_backed = true;
            } else if !bdm.no_device {
                bdm.boot_index = Some(-1);
            } else {
                bdm.boot_index = None;
            }
        }
    }

    if let Some(image_ref) = image_ref.filter(|_| !volume_backed) {
        bdms.insert(0, BlockDeviceMapping::image_root(image_ref.clone()));
    }

    Ok(bdms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_volume(id: &str, device: &str) -> LegacyBlockDevice {
        LegacyBlockDevice {
            device_name: Some(device.to_string()),
            volume_id: Some(VolumeId::new(id)),
            ..Default::default()
        }
    }

    #[test]
    fn ephemeral_names() {
        assert!(is_ephemeral_name("ephemeral0"));
        assert!(is_ephemeral_name("ephemeral12"));
        assert!(!is_ephemeral_name("ephemeral01"));
        assert!(!is_ephemeral_name("ephemeral"));
        assert!(is_swap_or_ephemeral("swap"));
    }

    #[test]
    fn virtual_names_become_blank_local_devices() {
        let swap = LegacyBlockDevice { virtual_name: Some("swap".into()), device_name: Some("/dev/vdc".into()), ..Default::default() };
        let bdm = from_legacy(&swap, None).unwrap();
        assert!(bdm.is_swap());
        assert!(bdm.delete_on_termination);

        let eph = LegacyBlockDevice { virtual_name: Some("ephemeral0".into()), ..Default::default() };
        assert_eq!(from_legacy(&eph, Some("ext4")).unwrap().guest_format.as_deref(), Some("ext4"));
    }

    #[test]
    fn unrecognized_entry_is_rejected() {
        assert!(matches!(from_legacy(&LegacyBlockDevice::default(), None), Err(Error::InvalidBdmFormat(_))));
    }

    #[test]
    fn root_volume_matching_root_name_boots() {
        let bdms = from_legacy_mapping(
            &[legacy_volume("v1", "/dev/vda"), legacy_volume("v2", "/dev/vdb")],
            Some(&ImageId::new("img")),
            Some("vda"),
            false,
            None,
        )
        .unwrap();

        assert_eq!(bdms.len(), 2);
        assert_eq!(bdms[0].boot_index, Some(0));
        assert_eq!(bdms[1].boot_index, Some(-1));
    }

    #[test]
    fn image_root_is_synthesized_when_no_volume_matches() {
        let bdms =
            from_legacy_mapping(&[legacy_volume("v2", "/dev/vdb")], Some(&ImageId::new("img")), Some("/dev/vda"), false, None)
                .unwrap();

        assert_eq!(bdms.len(), 2);
        assert_eq!(bdms[0].source_type, SourceType::Image);
        assert!(bdms[0].is_root());
    }

    #[test]
    fn first_non_blank_boots_without_image_or_root_name() {
        let swap = LegacyBlockDevice { virtual_name: Some("swap".into()), ..Default::default() };
        let bdms = from_legacy_mapping(&[swap, legacy_volume("v1", "/dev/vdb")], None, None, false, None).unwrap();

        assert_eq!(bdms[1].boot_index, Some(0));
        assert_eq!(bdms[0].boot_index, None);
    }
}

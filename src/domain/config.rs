use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::api::config_dto::{ComputeConfigDto, QuotaDto};
use crate::domain::quota::resource::QuotaResource;
use crate::error::{Error, Result};
use crate::loader::parser::parse_json_file;

/// Role of this orchestrator in a cell-partitioned deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Top-level API cell; forwards work to child cells.
    Api,
    /// Child cell running its own compute services.
    Compute,
}

impl FromStr for CellType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "api" => Ok(CellType::Api),
            "compute" => Ok(CellType::Compute),
            other => Err(Error::ConfigError(format!("Unknown cell type '{}'", other))),
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::Api => write!(f, "api"),
            CellType::Compute => write!(f, "compute"),
        }
    }
}

/// Default per-project limits. `-1` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLimits {
    pub instances: i64,
    pub cores: i64,
    pub ram: i64,
    pub floating_ips: i64,
    pub fixed_ips: i64,
    pub metadata_items: i64,
    pub injected_files: i64,
    pub injected_file_content_bytes: i64,
    pub injected_file_path_length: i64,
    pub security_groups: i64,
    pub security_group_rules: i64,
    pub key_pairs: i64,
    pub server_groups: i64,
    pub server_group_members: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            instances: 10,
            cores: 20,
            ram: 50 * 1024,
            floating_ips: 10,
            fixed_ips: -1,
            metadata_items: 128,
            injected_files: 5,
            injected_file_content_bytes: 10 * 1024,
            injected_file_path_length: 255,
            security_groups: 10,
            security_group_rules: 20,
            key_pairs: 100,
            server_groups: 10,
            server_group_members: 10,
        }
    }
}

impl QuotaLimits {
    pub fn as_map(&self) -> BTreeMap<QuotaResource, i64> {
        BTreeMap::from([
            (QuotaResource::Instances, self.instances),
            (QuotaResource::Cores, self.cores),
            (QuotaResource::Ram, self.ram),
            (QuotaResource::FloatingIps, self.floating_ips),
            (QuotaResource::FixedIps, self.fixed_ips),
            (QuotaResource::MetadataItems, self.metadata_items),
            (QuotaResource::InjectedFiles, self.injected_files),
            (QuotaResource::InjectedFileContentBytes, self.injected_file_content_bytes),
            (QuotaResource::InjectedFilePathBytes, self.injected_file_path_length),
            (QuotaResource::SecurityGroups, self.security_groups),
            (QuotaResource::SecurityGroupRules, self.security_group_rules),
            (QuotaResource::KeyPairs, self.key_pairs),
            (QuotaResource::ServerGroups, self.server_groups),
            (QuotaResource::ServerGroupMembers, self.server_group_members),
        ])
    }

    fn from_dto(dto: &QuotaDto) -> Result<Self> {
        let d = Self::default();
        let limits = Self {
            instances: dto.instances.unwrap_or(d.instances),
            cores: dto.cores.unwrap_or(d.cores),
            ram: dto.ram.unwrap_or(d.ram),
            floating_ips: dto.floating_ips.unwrap_or(d.floating_ips),
            fixed_ips: dto.fixed_ips.unwrap_or(d.fixed_ips),
            metadata_items: dto.metadata_items.unwrap_or(d.metadata_items),
            injected_files: dto.injected_files.unwrap_or(d.injected_files),
            injected_file_content_bytes: dto.injected_file_content_bytes.unwrap_or(d.injected_file_content_bytes),
            injected_file_path_length: dto.injected_file_path_length.unwrap_or(d.injected_file_path_length),
            security_groups: dto.security_groups.unwrap_or(d.security_groups),
            security_group_rules: dto.security_group_rules.unwrap_or(d.security_group_rules),
            key_pairs: dto.key_pairs.unwrap_or(d.key_pairs),
            server_groups: dto.server_groups.unwrap_or(d.server_groups),
            server_group_members: dto.server_group_members.unwrap_or(d.server_group_members),
        };

        if let Some((resource, limit)) = limits.as_map().into_iter().find(|(_, limit)| *limit < -1) {
            return Err(Error::ConfigError(format!("Quota limit for {} must be -1 or greater, got {}", resource, limit)));
        }
        Ok(limits)
    }
}

/// Explicit configuration handed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub cell_type: Option<CellType>,
    pub allow_resize_to_same_host: bool,
    /// Maximum number of `local` destination devices per instance; negative disables the check.
    pub max_local_block_devices: i64,
    /// Supports `{name}`, `{count}` and `{uuid}`.
    pub multi_instance_display_name_template: String,
    pub null_kernel: String,
    pub default_schedule_zone: Option<String>,
    pub default_ephemeral_format: Option<String>,
    pub max_userdata_size: usize,
    /// Seconds until a pending quota reservation expires.
    pub reservation_expire: i64,
    pub quota: QuotaLimits,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            cell_type: None,
            allow_resize_to_same_host: false,
            max_local_block_devices: 3,
            multi_instance_display_name_template: "{name}-{count}".to_string(),
            null_kernel: "nokernel".to_string(),
            default_schedule_zone: None,
            default_ephemeral_format: None,
            max_userdata_size: 65535,
            reservation_expire: 86400,
            quota: QuotaLimits::default(),
        }
    }
}

impl ComputeConfig {
    pub fn from_dto(dto: ComputeConfigDto) -> Result<Self> {
        let d = Self::default();

        let cell_type = dto.cell_type.as_deref().map(CellType::from_str).transpose()?;

        let template = dto.multi_instance_display_name_template.unwrap_or(d.multi_instance_display_name_template);
        if !template.contains("{name}") && !template.contains("{uuid}") && !template.contains("{count}") {
            return Err(Error::ConfigError(format!(
                "multiInstanceDisplayNameTemplate '{}' uses none of {{name}}, {{count}}, {{uuid}}",
                template
            )));
        }

        let reservation_expire = dto.reservation_expire.unwrap_or(d.reservation_expire);
        if reservation_expire < 0 {
            return Err(Error::ConfigError("reservationExpire must not be negative".to_string()));
        }

        Ok(Self {
            cell_type,
            allow_resize_to_same_host: dto.allow_resize_to_same_host.unwrap_or(d.allow_resize_to_same_host),
            max_local_block_devices: dto.max_local_block_devices.unwrap_or(d.max_local_block_devices),
            multi_instance_display_name_template: template,
            null_kernel: dto.null_kernel.unwrap_or(d.null_kernel),
            default_schedule_zone: dto.default_schedule_zone,
            default_ephemeral_format: dto.default_ephemeral_format,
            max_userdata_size: dto.max_userdata_size.unwrap_or(d.max_userdata_size),
            reservation_expire,
            quota: QuotaLimits::from_dto(&dto.quota)?,
        })
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(file_path: &str) -> Result<Self> {
        let dto = parse_json_file::<ComputeConfigDto>(file_path)?;
        log::info!("Configuration file '{}' parsed successfully.", file_path);
        Self::from_dto(dto)
    }
}

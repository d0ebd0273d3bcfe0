use serde::{Deserialize, Serialize};

/// On-disk shape of the orchestrator configuration. Every field is optional;
/// missing values fall back to the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeConfigDto {
    pub cell_type: Option<String>,
    pub allow_resize_to_same_host: Option<bool>,
    pub max_local_block_devices: Option<i64>,
    pub multi_instance_display_name_template: Option<String>,
    pub null_kernel: Option<String>,
    pub default_schedule_zone: Option<String>,
    pub default_ephemeral_format: Option<String>,
    pub max_userdata_size: Option<usize>,
    pub reservation_expire: Option<i64>,
    pub quota: QuotaDto,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaDto {
    pub instances: Option<i64>,
    pub cores: Option<i64>,
    pub ram: Option<i64>,
    pub floating_ips: Option<i64>,
    pub fixed_ips: Option<i64>,
    pub metadata_items: Option<i64>,
    pub injected_files: Option<i64>,
    pub injected_file_content_bytes: Option<i64>,
    pub injected_file_path_length: Option<i64>,
    pub security_groups: Option<i64>,
    pub security_group_rules: Option<i64>,
    pub key_pairs: Option<i64>,
    pub server_groups: Option<i64>,
    pub server_group_members: Option<i64>,
}

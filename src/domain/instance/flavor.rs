use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::utils::id::FlavorId;

const VIDEO_RAM_SPEC: &str = "hw_video:ram_max_mb";

/// Immutable resource template an instance is booted with.
///
/// Instances keep their own copy, so later catalog edits never change a
/// running instance's accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub flavorid: FlavorId,
    pub name: String,
    pub vcpus: i64,
    pub memory_mb: i64,
    pub root_gb: i64,
    pub ephemeral_gb: i64,
    /// Swap size in MiB.
    pub swap: i64,
    pub disabled: bool,
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    pub fn new(flavorid: impl Into<String>, vcpus: i64, memory_mb: i64, root_gb: i64) -> Self {
        let flavorid = FlavorId::new(flavorid);
        Self {
            name: flavorid.to_string(),
            flavorid,
            vcpus,
            memory_mb,
            root_gb,
            ephemeral_gb: 0,
            swap: 0,
            disabled: false,
            extra_specs: BTreeMap::new(),
        }
    }

    pub fn with_ephemeral(mut self, ephemeral_gb: i64) -> Self {
        self.ephemeral_gb = ephemeral_gb;
        self
    }

    pub fn with_swap(mut self, swap_mb: i64) -> Self {
        self.swap = swap_mb;
        self
    }

    pub fn with_extra_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_specs.insert(key.into(), value.into());
        self
    }

    /// Video RAM cap declared through extra specs, counted against the ram quota.
    pub fn video_ram_mb(&self) -> i64 {
        self.extra_specs.get(VIDEO_RAM_SPEC).and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0)
    }

    /// Memory charged against the ram quota for one instance.
    pub fn quota_ram_mb(&self) -> i64 {
        self.memory_mb + self.video_ram_mb()
    }
}

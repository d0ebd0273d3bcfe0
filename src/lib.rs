use crate::domain::compute::{Collaborators, ComputeApi};
use crate::domain::config::ComputeConfig;
use crate::domain::placement::PlacementStore;
use crate::domain::quota::QuotaLedger;
use crate::error::Result;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Builds an orchestrator from a JSON configuration file, backed by the
/// in-memory collaborators.
pub fn compute_api_from_file(file_path: &str) -> Result<ComputeApi> {
    let config = ComputeConfig::load(file_path)?;
    log::info!("Configuration validated. Constructing ComputeApi.");

    let quota = QuotaLedger::new(&config.quota, config.reservation_expire);
    let services = Collaborators::in_memory(&quota);
    let compute_api = ComputeApi::new(config, quota, PlacementStore::default(), services);
    log::info!("ComputeApi constructed successfully.");

    Ok(compute_api)
}

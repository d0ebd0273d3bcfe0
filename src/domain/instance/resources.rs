use serde::{Deserialize, Serialize};

use crate::domain::instance::flavor::Flavor;
use crate::domain::services::image::ImageMeta;
use crate::error::{Error, Result};

const NUMA_NODES_SPEC: &str = "hw:numa_nodes";
const NUMA_NODES_PROP: &str = "hw_numa_nodes";
const PCI_ALIAS_SPEC: &str = "pci_passthrough:alias";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaCell {
    pub id: u32,
    pub cpus: Vec<u32>,
    pub memory_mb: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaTopology {
    pub cells: Vec<NumaCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciRequest {
    pub alias_name: String,
    pub count: u32,
}

/// Guest NUMA layout requested by the flavor (or, failing that, the image).
///
/// vCPUs and memory are split evenly; a flavor that cannot be split evenly
/// across the requested node count is rejected.
pub fn numa_constraints(flavor: &Flavor, image: &ImageMeta) -> Result<Option<NumaTopology>> {
    let requested = flavor
        .extra_specs
        .get(NUMA_NODES_SPEC)
        .cloned()
        .or_else(|| image.property_str(NUMA_NODES_PROP));

    let Some(raw) = requested else {
        return Ok(None);
    };

    let nodes: u32 = raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("Invalid {} value '{}'", NUMA_NODES_SPEC, raw)))?;
    if nodes == 0 {
        return Err(Error::InvalidRequest(format!("{} must be at least 1", NUMA_NODES_SPEC)));
    }

    let vcpus = u32::try_from(flavor.vcpus).unwrap_or(0);
    if vcpus % nodes != 0 || flavor.memory_mb % i64::from(nodes) != 0 {
        return Err(Error::InvalidRequest(format!(
            "Flavor {} cannot be split evenly across {} NUMA nodes",
            flavor.flavorid, nodes
        )));
    }

    let cpus_per_node = vcpus / nodes;
    let memory_per_node = flavor.memory_mb / i64::from(nodes);
    let cells = (0..nodes)
        .map(|id| NumaCell {
            id,
            cpus: (id * cpus_per_node..(id + 1) * cpus_per_node).collect(),
            memory_mb: memory_per_node,
        })
        .collect();

    Ok(Some(NumaTopology { cells }))
}

/// PCI passthrough requests from the flavor's `alias:count[,alias:count]` extra spec.
pub fn pci_requests(flavor: &Flavor) -> Result<Vec<PciRequest>> {
    let Some(raw) = flavor.extra_specs.get(PCI_ALIAS_SPEC) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (alias, count) = entry.split_once(':').unwrap_or((entry, "1"));
            let count: u32 = count
                .trim()
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("Invalid PCI alias definition '{}'", entry)))?;
            Ok(PciRequest { alias_name: alias.trim().to_string(), count })
        })
        .collect()
}

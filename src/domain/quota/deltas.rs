use crate::domain::instance::flavor::Flavor;
use crate::domain::quota::ledger::QuotaDeltas;
use crate::domain::quota::resource::QuotaResource;

/// Deltas charged for `count` instances of `flavor`.
pub fn instance_deltas(flavor: &Flavor, count: i64) -> QuotaDeltas {
    QuotaDeltas::from([
        (QuotaResource::Instances, count),
        (QuotaResource::Cores, count * flavor.vcpus),
        (QuotaResource::Ram, count * flavor.quota_ram_mb()),
    ])
}

/// Core and ram differences between two flavors.
///
/// Each difference is `sense * (new - old)` and is kept only when
/// `compare * difference > 0`, so `compare` selects growth (`1`) or
/// shrinkage (`-1`).
pub fn resize_quota_delta(new_flavor: &Flavor, old_flavor: &Flavor, sense: i64, compare: i64) -> QuotaDeltas {
    let mut deltas = QuotaDeltas::new();
    let cores = sense * (new_flavor.vcpus - old_flavor.vcpus);
    if compare * cores > 0 {
        deltas.insert(QuotaResource::Cores, cores);
    }
    let ram = sense * (new_flavor.memory_mb - old_flavor.memory_mb);
    if compare * ram > 0 {
        deltas.insert(QuotaResource::Ram, ram);
    }
    deltas
}

/// Extra resources a resize needs up front.
pub fn upsize(new_flavor: &Flavor, old_flavor: &Flavor) -> QuotaDeltas {
    resize_quota_delta(new_flavor, old_flavor, 1, 1)
}

/// Resources released once a downsizing resize is confirmed.
pub fn downsize(new_flavor: &Flavor, old_flavor: &Flavor) -> QuotaDeltas {
    resize_quota_delta(new_flavor, old_flavor, 1, -1)
}

/// Gives back what `upsize` charged when a resize is reverted.
pub fn reverse_upsize(new_flavor: &Flavor, old_flavor: &Flavor) -> QuotaDeltas {
    resize_quota_delta(new_flavor, old_flavor, -1, -1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Flavor {
        Flavor::new("small", 1, 2048, 20)
    }

    fn large() -> Flavor {
        Flavor::new("large", 4, 8192, 80)
    }

    #[test]
    fn upsize_keeps_only_growth() {
        let deltas = upsize(&large(), &small());
        assert_eq!(deltas[&QuotaResource::Cores], 3);
        assert_eq!(deltas[&QuotaResource::Ram], 6144);
        assert!(upsize(&small(), &large()).is_empty());
    }

    #[test]
    fn downsize_keeps_only_shrinkage() {
        let deltas = downsize(&small(), &large());
        assert_eq!(deltas[&QuotaResource::Cores], -3);
        assert_eq!(deltas[&QuotaResource::Ram], -6144);
        assert!(downsize(&large(), &small()).is_empty());
    }

    #[test]
    fn reverse_upsize_negates_growth() {
        let deltas = reverse_upsize(&large(), &small());
        assert_eq!(deltas[&QuotaResource::Cores], -3);
        assert_eq!(deltas[&QuotaResource::Ram], -6144);
    }

    #[test]
    fn mixed_resize_splits_by_direction() {
        let new = Flavor::new("cpu", 8, 1024, 20);
        let old = small();
        assert_eq!(upsize(&new, &old), QuotaDeltas::from([(QuotaResource::Cores, 7)]));
        assert_eq!(downsize(&new, &old), QuotaDeltas::from([(QuotaResource::Ram, -1024)]));
    }

    #[test]
    fn instance_deltas_include_video_ram() {
        let flavor = small().with_extra_spec("hw_video:ram_max_mb", "16");
        let deltas = instance_deltas(&flavor, 2);
        assert_eq!(deltas[&QuotaResource::Instances], 2);
        assert_eq!(deltas[&QuotaResource::Cores], 2);
        assert_eq!(deltas[&QuotaResource::Ram], 4128);
    }
}

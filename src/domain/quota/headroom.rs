use std::collections::BTreeMap;

use crate::domain::quota::ledger::{QuotaDeltas, QuotaUsage};
use crate::domain::quota::resource::QuotaResource;

/// Remaining capacity per resource: `quota - (in_use + reserved)`.
///
/// An unlimited (`-1`) cores or ram quota is bounded by the instance
/// headroom instead: `instances_headroom * delta[res] / delta[instances]`,
/// using the deltas of the request that was rejected. Without a per-request
/// delta the instance headroom itself is used.
pub fn headroom(
    quotas: &BTreeMap<QuotaResource, i64>,
    usages: &BTreeMap<QuotaResource, QuotaUsage>,
    deltas: &QuotaDeltas,
) -> BTreeMap<QuotaResource, i64> {
    let mut headroom: BTreeMap<QuotaResource, i64> = usages
        .iter()
        .filter_map(|(resource, usage)| quotas.get(resource).map(|quota| (*resource, quota - usage.total())))
        .collect();

    let instances_headroom = headroom.get(&QuotaResource::Instances).copied().unwrap_or(1);
    let instances_delta = deltas.get(&QuotaResource::Instances).copied().unwrap_or(1);

    for resource in [QuotaResource::Cores, QuotaResource::Ram] {
        if quotas.get(&resource) != Some(&-1) {
            continue;
        }
        let bounded = match deltas.get(&resource) {
            Some(delta) if instances_delta != 0 => (instances_headroom * delta).div_euclid(instances_delta),
            _ => instances_headroom,
        };
        headroom.insert(resource, bounded);
    }

    headroom
}

/// Caller-facing detail strings for a quota failure: `(overs, requested, used, allowed)`.
pub fn over_quota_detail(
    headroom: &BTreeMap<QuotaResource, i64>,
    overs: &[QuotaResource],
    quotas: &BTreeMap<QuotaResource, i64>,
    requested: &QuotaDeltas,
) -> (String, String, String, String) {
    let mut reqs = Vec::with_capacity(overs.len());
    let mut useds = Vec::with_capacity(overs.len());
    let mut alloweds = Vec::with_capacity(overs.len());

    for resource in overs {
        let quota = quotas.get(resource).copied().unwrap_or(-1);
        reqs.push(requested.get(resource).copied().unwrap_or(0).to_string());
        useds.push((quota - headroom.get(resource).copied().unwrap_or(0)).to_string());
        alloweds.push(quota.to_string());
    }

    let names: Vec<&str> = overs.iter().map(|r| r.as_str()).collect();
    (names.join(", "), reqs.join(", "), useds.join(", "), alloweds.join(", "))
}

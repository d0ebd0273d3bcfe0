use std::collections::BTreeMap;

use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::context::RequestContext;
use crate::domain::instance::flavor::Flavor;
use crate::domain::quota::deltas::instance_deltas;
use crate::domain::quota::headroom::{headroom, over_quota_detail};
use crate::domain::quota::ledger::QuotaDeltas;
use crate::domain::quota::reservation::QuotaReservation;
use crate::domain::quota::resource::QuotaResource;
use crate::error::{Error, Result};

const MAX_METADATA_FIELD_LEN: usize = 255;

impl ComputeApi {
    /// Reserves quota for between `min_count` and `max_count` instances of
    /// `flavor`, shrinking the request to what still fits.
    ///
    /// Returns the number of instances admitted together with the single
    /// reservation covering all of them.
    ///
    /// # Errors
    /// `TooManyInstances` when not even `min_count` instances fit.
    pub fn check_num_instances_quota(
        &self,
        ctx: &RequestContext,
        flavor: &Flavor,
        min_count: u32,
        max_count: u32,
    ) -> Result<(u32, QuotaReservation)> {
        let deltas = instance_deltas(flavor, i64::from(max_count));

        let detail = match self.quota.reserve(&deltas, &ctx.project_id, Some(&ctx.user_id)) {
            Ok(reservation) => return Ok((max_count, reservation)),
            Err(Error::OverQuota(detail)) => detail,
            Err(e) => return Err(e),
        };

        let headroom = headroom(&detail.quotas, &detail.usages, &deltas);

        let mut allowed = headroom.get(&QuotaResource::Instances).copied().unwrap_or(1);
        if flavor.vcpus > 0 {
            allowed = allowed.min(headroom.get(&QuotaResource::Cores).copied().unwrap_or(0).div_euclid(flavor.vcpus));
        }
        let ram_per_instance = flavor.quota_ram_mb();
        if flavor.memory_mb > 0 && ram_per_instance > 0 {
            allowed = allowed.min(headroom.get(&QuotaResource::Ram).copied().unwrap_or(0).div_euclid(ram_per_instance));
        }

        let message = if allowed <= 0 {
            "Cannot run any more instances of this type.".to_string()
        } else if i64::from(min_count) <= allowed && allowed < i64::from(max_count) {
            log::debug!("ComputeApi: project {} can run {} of {} requested instances", ctx.project_id, allowed, max_count);
            let allowed = u32::try_from(allowed).unwrap_or(min_count);
            return self.check_num_instances_quota(ctx, flavor, min_count, allowed);
        } else {
            format!("Can only run {} more instances of this type.", allowed)
        };

        let num_instances =
            if min_count == max_count { min_count.to_string() } else { format!("{}-{}", min_count, max_count) };
        let (overs, _, used, total_allowed) = over_quota_detail(&headroom, &detail.overs, &detail.quotas, &deltas);
        let req: Vec<String> = detail
            .overs
            .iter()
            .map(|resource| match resource {
                QuotaResource::Instances => num_instances.clone(),
                other => deltas.get(other).copied().unwrap_or(0).to_string(),
            })
            .collect();

        log::debug!(
            "ComputeApi: {} quota exceeded for {}, tried to run {} instances. {}",
            overs,
            ctx.project_id,
            num_instances,
            message
        );
        Err(Error::TooManyInstances {
            overs,
            req: req.join(", "),
            used,
            allowed: total_allowed,
            headroom: Some(allowed.max(0)),
            message,
        })
    }

    /// Metadata item count against quota, key and value lengths against the
    /// storage limits.
    pub fn check_metadata_properties_quota(&self, ctx: &RequestContext, metadata: &BTreeMap<String, String>) -> Result<()> {
        let values: QuotaDeltas = [(QuotaResource::MetadataItems, metadata.len() as i64)].into_iter().collect();
        if let Err(e) = self.quota.limit_check(&ctx.project_id, &values) {
            return match e {
                Error::OverQuota(detail) => Err(Error::MetadataLimitExceeded {
                    allowed: detail.quotas.get(&QuotaResource::MetadataItems).copied().unwrap_or(0),
                }),
                other => Err(other),
            };
        }

        for (key, value) in metadata {
            if key.is_empty() {
                return Err(Error::InvalidMetadata("Metadata property key must not be empty".to_string()));
            }
            if key.chars().count() > MAX_METADATA_FIELD_LEN {
                return Err(Error::InvalidMetadataSize("Metadata property key greater than 255 characters".to_string()));
            }
            if value.chars().count() > MAX_METADATA_FIELD_LEN {
                return Err(Error::InvalidMetadataSize("Metadata property value greater than 255 characters".to_string()));
            }
        }
        Ok(())
    }

    /// File count first, then the longest path and content. A path that is
    /// too long is reported even when the content is too long as well.
    pub fn check_injected_file_quota(&self, ctx: &RequestContext, injected_files: &[(String, String)]) -> Result<()> {
        if injected_files.is_empty() {
            return Ok(());
        }

        let count: QuotaDeltas = [(QuotaResource::InjectedFiles, injected_files.len() as i64)].into_iter().collect();
        if let Err(e) = self.quota.limit_check(&ctx.project_id, &count) {
            return match e {
                Error::OverQuota(_) => Err(Error::OnsetFileLimitExceeded),
                other => Err(other),
            };
        }

        let max_path = injected_files.iter().map(|(path, _)| path.len()).max().unwrap_or(0);
        let max_content = injected_files.iter().map(|(_, content)| content.len()).max().unwrap_or(0);
        let lengths: QuotaDeltas = [
            (QuotaResource::InjectedFilePathBytes, max_path as i64),
            (QuotaResource::InjectedFileContentBytes, max_content as i64),
        ]
        .into_iter()
        .collect();

        match self.quota.limit_check(&ctx.project_id, &lengths) {
            Ok(()) => Ok(()),
            Err(Error::OverQuota(detail)) if detail.overs.contains(&QuotaResource::InjectedFilePathBytes) => {
                Err(Error::OnsetFilePathLimitExceeded)
            }
            Err(Error::OverQuota(_)) => Err(Error::OnsetFileContentLimitExceeded),
            Err(e) => Err(e),
        }
    }
}

use std::collections::BTreeMap;

use crate::domain::compute::compute_api::ComputeApi;
use crate::domain::compute::guard::{self, check_instance_lock};
use crate::domain::context::RequestContext;
use crate::domain::services::compute_rpc::{HostWorkOrder, MetadataChange};
use crate::domain::utils::id::InstanceId;
use crate::error::Result;

impl ComputeApi {
    /// Merges `metadata` into the instance metadata, or replaces it entirely
    /// when `replace` is set, and tells the host what changed.
    pub fn update_instance_metadata(
        &self,
        ctx: &RequestContext,
        instance_uuid: &InstanceId,
        metadata: BTreeMap<String, String>,
        replace: bool,
    ) -> Result<BTreeMap<String, String>> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::UPDATE_METADATA.check(&instance)?;

        let original = instance.metadata.clone();
        let updated = if replace {
            metadata
        } else {
            let mut merged = original.clone();
            merged.extend(metadata);
            merged
        };
        self.check_metadata_properties_quota(ctx, &updated)?;

        instance.metadata = updated;
        let instance = self.resolver.save_instance(&instance, None)?;

        let diff = metadata_diff(&original, &instance.metadata);
        log::debug!("ComputeApi {}: metadata changed for {} keys", instance.uuid, diff.len());
        self.cast_to_host(ctx, &instance, HostWorkOrder::ChangeInstanceMetadata { diff })?;
        Ok(instance.metadata)
    }

    /// Removing a key that is not set still notifies the host.
    pub fn delete_instance_metadata(&self, ctx: &RequestContext, instance_uuid: &InstanceId, key: &str) -> Result<()> {
        let mut instance = self.get(ctx, instance_uuid)?;
        check_instance_lock(ctx, &instance)?;
        guard::DELETE_METADATA.check(&instance)?;

        instance.metadata.remove(key);
        let instance = self.resolver.save_instance(&instance, None)?;

        let diff = BTreeMap::from([(key.to_string(), MetadataChange::Delete)]);
        self.cast_to_host(ctx, &instance, HostWorkOrder::ChangeInstanceMetadata { diff })
    }
}

/// Keys that were added or changed map to their new value, removed keys to
/// `Delete`. Unchanged keys are left out.
pub fn metadata_diff(original: &BTreeMap<String, String>, updated: &BTreeMap<String, String>) -> BTreeMap<String, MetadataChange> {
    let removed = original.keys().filter(|key| !updated.contains_key(*key)).map(|key| (key.clone(), MetadataChange::Delete));
    let changed = updated
        .iter()
        .filter(|(key, value)| original.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), MetadataChange::Set(value.clone())));
    removed.chain(changed).collect()
}

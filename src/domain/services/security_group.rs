use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::context::RequestContext;
use crate::domain::quota::ledger::QuotaLedger;
use crate::domain::quota::resource::QuotaResource;
use crate::domain::utils::id::{ProjectId, UserId};
use crate::error::{Error, Result};

pub const DEFAULT_SECURITY_GROUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub name: String,
    pub description: String,
    pub project_id: ProjectId,
    pub user_id: UserId,
}

pub trait SecurityGroupService: Debug + Send + Sync {
    fn get(&self, ctx: &RequestContext, name: &str) -> Result<Option<SecurityGroup>>;

    /// Creates the project's `default` group if it does not exist yet.
    fn ensure_default(&self, ctx: &RequestContext) -> Result<()>;

    fn create(&self, ctx: &RequestContext, name: &str, description: &str) -> Result<SecurityGroup>;

    fn destroy(&self, ctx: &RequestContext, name: &str) -> Result<()>;
}

/// Security groups held in process memory, counted against the
/// `security_groups` quota.
#[derive(Debug, Clone)]
pub struct InMemorySecurityGroupService {
    groups: Arc<RwLock<BTreeMap<(ProjectId, String), SecurityGroup>>>,
    quota: QuotaLedger,
}

fn validate_property(value: &str, property: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 255 {
        return Err(Error::InvalidRequest(format!("Security group {} should be 1 to 255 characters", property)));
    }
    Ok(())
}

impl InMemorySecurityGroupService {
    pub fn new(quota: QuotaLedger) -> Self {
        Self { groups: Arc::new(RwLock::new(BTreeMap::new())), quota }
    }

    fn insert(&self, group: SecurityGroup) -> Result<SecurityGroup> {
        let mut guard = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let key = (group.project_id.clone(), group.name.clone());
        if guard.contains_key(&key) {
            return Err(Error::SecurityGroupExists { project_id: group.project_id, name: group.name });
        }
        guard.insert(key, group.clone());
        Ok(group)
    }
}

impl SecurityGroupService for InMemorySecurityGroupService {
    fn get(&self, ctx: &RequestContext, name: &str) -> Result<Option<SecurityGroup>> {
        let guard = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&(ctx.project_id.clone(), name.to_string())).cloned())
    }

    fn ensure_default(&self, ctx: &RequestContext) -> Result<()> {
        if self.get(ctx, DEFAULT_SECURITY_GROUP)?.is_some() {
            return Ok(());
        }
        let default = SecurityGroup {
            name: DEFAULT_SECURITY_GROUP.to_string(),
            description: "default".to_string(),
            project_id: ctx.project_id.clone(),
            user_id: ctx.user_id.clone(),
        };
        match self.insert(default) {
            Ok(_) | Err(Error::SecurityGroupExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn create(&self, ctx: &RequestContext, name: &str, description: &str) -> Result<SecurityGroup> {
        validate_property(name, "name")?;
        validate_property(description, "description")?;

        let deltas = [(QuotaResource::SecurityGroups, 1)].into_iter().collect();
        let reservation = match self.quota.reserve(&deltas, &ctx.project_id, Some(&ctx.user_id)) {
            Ok(reservation) => reservation,
            Err(Error::OverQuota(_)) => return Err(Error::SecurityGroupLimitExceeded),
            Err(e) => return Err(e),
        };

        log::info!("SecurityGroups: create security group {} for project {}", name, ctx.project_id);
        let created = self.ensure_default(ctx).and_then(|_| {
            self.insert(SecurityGroup {
                name: name.to_string(),
                description: description.to_string(),
                project_id: ctx.project_id.clone(),
                user_id: ctx.user_id.clone(),
            })
        });

        match created {
            Ok(group) => {
                reservation.commit()?;
                Ok(group)
            }
            Err(e) => {
                reservation.rollback();
                Err(e)
            }
        }
    }

    /// Removing a group that is already gone is not an error.
    fn destroy(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let deltas = [(QuotaResource::SecurityGroups, -1)].into_iter().collect();
        let reservation = self.quota.reserve(&deltas, &ctx.project_id, Some(&ctx.user_id))?;

        let removed = self.groups.write().unwrap_or_else(PoisonError::into_inner).remove(&(ctx.project_id.clone(), name.to_string()));
        match removed {
            Some(_) => reservation.commit(),
            None => {
                log::debug!("SecurityGroups: group {} of project {} already gone", name, ctx.project_id);
                reservation.rollback();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::QuotaLimits;

    fn service() -> (InMemorySecurityGroupService, QuotaLedger) {
        let ledger = QuotaLedger::new(&QuotaLimits::default(), 86400);
        (InMemorySecurityGroupService::new(ledger.clone()), ledger)
    }

    #[test]
    fn duplicate_name_is_a_conflict_and_releases_quota() {
        let (groups, ledger) = service();
        let ctx = RequestContext::new("p1", "u1");

        groups.create(&ctx, "web", "web tier").unwrap();
        let err = groups.create(&ctx, "web", "again").unwrap_err();

        assert!(matches!(err, Error::SecurityGroupExists { .. }));
        let usage = ledger.usages(&ctx.project_id, None)[&QuotaResource::SecurityGroups];
        assert_eq!((usage.in_use, usage.reserved), (1, 0));
        assert!(groups.get(&ctx, DEFAULT_SECURITY_GROUP).unwrap().is_some());
    }

    #[test]
    fn quota_limits_group_count() {
        let (groups, ledger) = service();
        let ctx = RequestContext::new("p1", "u1");
        ledger.set_project_limit(&ctx.project_id, QuotaResource::SecurityGroups, 1);

        groups.create(&ctx, "a", "a").unwrap();
        assert!(matches!(groups.create(&ctx, "b", "b"), Err(Error::SecurityGroupLimitExceeded)));
    }

    #[test]
    fn destroying_a_missing_group_is_benign() {
        let (groups, _) = service();
        assert!(groups.destroy(&RequestContext::new("p1", "u1"), "ghost").is_ok());
    }
}

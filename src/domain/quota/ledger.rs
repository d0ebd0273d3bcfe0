use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use slotmap::{SlotMap, new_key_type};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::config::QuotaLimits;
use crate::domain::quota::reservation::QuotaReservation;
use crate::domain::quota::resource::QuotaResource;
use crate::domain::utils::id::{ProjectId, UserId};
use crate::domain::utils::strutils::generate_uid;
use crate::error::{Error, OverQuotaDetail, Result};

/// Resource -> signed change requested against the ledger.
pub type QuotaDeltas = BTreeMap<QuotaResource, i64>;

new_key_type! {
    pub struct ReservationKey;
}

/// Consumption of one resource within one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub in_use: i64,
    pub reserved: i64,
}

impl QuotaUsage {
    pub fn total(&self) -> i64 {
        self.in_use + self.reserved
    }
}

type Usages = BTreeMap<QuotaResource, QuotaUsage>;
type Limits = BTreeMap<QuotaResource, i64>;

#[derive(Debug, Clone)]
struct ReservationRecord {
    token: String,
    project_id: ProjectId,
    user_id: Option<UserId>,
    deltas: QuotaDeltas,
    expire: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerInner {
    default_limits: Limits,
    project_limits: HashMap<ProjectId, Limits>,
    user_limits: HashMap<(ProjectId, UserId), Limits>,
    project_usages: HashMap<ProjectId, Usages>,
    user_usages: HashMap<(ProjectId, UserId), Usages>,
    reservations: SlotMap<ReservationKey, ReservationRecord>,
}

impl LedgerInner {
    fn project_quotas(&self, project_id: &ProjectId) -> Limits {
        let mut quotas = self.default_limits.clone();
        if let Some(overrides) = self.project_limits.get(project_id) {
            quotas.extend(overrides.iter().map(|(r, l)| (*r, *l)));
        }
        quotas
    }

    fn user_quotas(&self, project_id: &ProjectId, user_id: &UserId) -> Limits {
        let mut quotas = self.project_quotas(project_id);
        if let Some(overrides) = self.user_limits.get(&(project_id.clone(), user_id.clone())) {
            quotas.extend(overrides.iter().map(|(r, l)| (*r, *l)));
        }
        quotas
    }

    fn apply(&mut self, record: &ReservationRecord, commit: bool) {
        let mut scopes: Vec<&mut Usages> = Vec::with_capacity(2);
        let project_usages = self.project_usages.entry(record.project_id.clone()).or_default();
        scopes.push(project_usages);
        if let Some(user_id) = &record.user_id {
            let user_usages = self.user_usages.entry((record.project_id.clone(), user_id.clone())).or_default();
            scopes.push(user_usages);
        }

        for usages in scopes {
            for (resource, delta) in &record.deltas {
                let usage = usages.entry(*resource).or_default();
                if *delta > 0 {
                    usage.reserved = (usage.reserved - delta).max(0);
                }
                if commit {
                    usage.in_use = (usage.in_use + delta).max(0);
                }
            }
        }
    }
}

/// Per resource, the limit and usage of whichever scope has less room left.
fn tighter_scope(project_quotas: &Limits, project_usages: &Usages, user_quotas: &Limits, user_usages: &Usages) -> (Limits, Usages) {
    let room = |quotas: &Limits, usages: &Usages, resource: &QuotaResource| {
        let limit = quotas.get(resource).copied().unwrap_or(-1);
        if limit < 0 { i64::MAX } else { limit - usages.get(resource).map(QuotaUsage::total).unwrap_or(0) }
    };

    let mut quotas = Limits::new();
    let mut usages = Usages::new();
    for resource in project_quotas.keys().chain(user_quotas.keys()).filter(|r| r.is_reservable()) {
        let (scope_quotas, scope_usages) =
            if room(user_quotas, user_usages, resource) < room(project_quotas, project_usages, resource) {
                (user_quotas, user_usages)
            } else {
                (project_quotas, project_usages)
            };
        quotas.insert(*resource, scope_quotas.get(resource).copied().unwrap_or(-1));
        usages.insert(*resource, scope_usages.get(resource).copied().unwrap_or_default());
    }
    (quotas, usages)
}

/// Per-project / per-user resource ledger.
///
/// Reservations mutate the `reserved` column immediately and stay pending
/// until the returned [`QuotaReservation`] is committed or rolled back.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    inner: Arc<RwLock<LedgerInner>>,
    reservation_expire: Duration,
}

impl QuotaLedger {
    pub fn new(limits: &QuotaLimits, reservation_expire_secs: i64) -> Self {
        let inner = LedgerInner {
            default_limits: limits.as_map(),
            project_limits: HashMap::new(),
            user_limits: HashMap::new(),
            project_usages: HashMap::new(),
            user_usages: HashMap::new(),
            reservations: SlotMap::with_key(),
        };
        Self { inner: Arc::new(RwLock::new(inner)), reservation_expire: Duration::seconds(reservation_expire_secs) }
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    //---------------------
    // --- Limits & usages ---

    pub fn set_project_limit(&self, project_id: &ProjectId, resource: QuotaResource, limit: i64) {
        self.write().project_limits.entry(project_id.clone()).or_default().insert(resource, limit);
    }

    pub fn set_user_limit(&self, project_id: &ProjectId, user_id: &UserId, resource: QuotaResource, limit: i64) {
        self.write().user_limits.entry((project_id.clone(), user_id.clone())).or_default().insert(resource, limit);
    }

    pub fn project_quotas(&self, project_id: &ProjectId) -> Limits {
        self.read().project_quotas(project_id)
    }

    pub fn user_quotas(&self, project_id: &ProjectId, user_id: &UserId) -> Limits {
        self.read().user_quotas(project_id, user_id)
    }

    /// Usages of the project, or of one user inside it.
    pub fn usages(&self, project_id: &ProjectId, user_id: Option<&UserId>) -> Usages {
        let guard = self.read();
        let usages = match user_id {
            Some(user_id) => guard.user_usages.get(&(project_id.clone(), user_id.clone())),
            None => guard.project_usages.get(project_id),
        };
        usages.cloned().unwrap_or_default()
    }

    /// Overwrites the in-use count of a resource, as a usage refresh would.
    pub fn set_in_use(&self, project_id: &ProjectId, user_id: Option<&UserId>, resource: QuotaResource, in_use: i64) {
        let mut guard = self.write();
        guard.project_usages.entry(project_id.clone()).or_default().entry(resource).or_default().in_use = in_use;
        if let Some(user_id) = user_id {
            guard.user_usages.entry((project_id.clone(), user_id.clone())).or_default().entry(resource).or_default().in_use =
                in_use;
        }
    }

    pub fn pending_reservations(&self) -> usize {
        self.read().reservations.len()
    }

    //---------------------
    // --- Reservations ---

    /// Reserves `deltas` for the project (and user, when given).
    ///
    /// # Errors
    /// `Error::OverQuota` listing every resource whose limit would be exceeded,
    /// with the quotas and usages of the tighter scope.
    pub fn reserve(
        &self,
        deltas: &QuotaDeltas,
        project_id: &ProjectId,
        user_id: Option<&UserId>,
    ) -> Result<QuotaReservation> {
        if deltas.is_empty() {
            return Ok(QuotaReservation::empty());
        }

        let unknown: Vec<&str> = deltas.keys().filter(|r| !r.is_reservable()).map(|r| r.as_str()).collect();
        if !unknown.is_empty() {
            return Err(Error::QuotaResourceUnknown(unknown.join(", ")));
        }

        let mut guard = self.write();
        let project_quotas = guard.project_quotas(project_id);
        let project_usages = guard.project_usages.get(project_id).cloned().unwrap_or_default();
        let (user_quotas, user_usages) = match user_id {
            Some(user_id) => (
                guard.user_quotas(project_id, user_id),
                guard.user_usages.get(&(project_id.clone(), user_id.clone())).cloned().unwrap_or_default(),
            ),
            None => (project_quotas.clone(), project_usages.clone()),
        };

        let mut overs = Vec::new();
        for (resource, delta) in deltas {
            if *delta < 0 {
                continue;
            }
            let exceeds = |quotas: &Limits, usages: &Usages| {
                let limit = quotas.get(resource).copied().unwrap_or(-1);
                let total = usages.get(resource).map(QuotaUsage::total).unwrap_or(0);
                limit >= 0 && limit < delta + total
            };
            if exceeds(&project_quotas, &project_usages) || exceeds(&user_quotas, &user_usages) {
                overs.push(*resource);
            }
        }

        if !overs.is_empty() {
            let (quotas, usages) = tighter_scope(&project_quotas, &project_usages, &user_quotas, &user_usages);
            log::info!("QuotaLedger: reservation for project {} exceeds quota for {:?}", project_id, overs);
            return Err(Error::OverQuota(Box::new(OverQuotaDetail { overs, quotas, usages })));
        }

        let record = ReservationRecord {
            token: generate_uid("r"),
            project_id: project_id.clone(),
            user_id: user_id.cloned(),
            deltas: deltas.clone(),
            expire: Utc::now() + self.reservation_expire,
        };

        let positive: Vec<(QuotaResource, i64)> = deltas.iter().filter(|(_, d)| **d > 0).map(|(r, d)| (*r, *d)).collect();
        for (resource, delta) in &positive {
            guard.project_usages.entry(project_id.clone()).or_default().entry(*resource).or_default().reserved += delta;
            if let Some(user_id) = user_id {
                guard.user_usages.entry((project_id.clone(), user_id.clone())).or_default().entry(*resource).or_default().reserved +=
                    delta;
            }
        }

        let token = record.token.clone();
        let key = guard.reservations.insert(record);
        log::debug!("QuotaLedger: created reservation {} for project {} with deltas {:?}", token, project_id, deltas);

        Ok(QuotaReservation::new(self.clone(), key, token, deltas.clone(), project_id.clone(), user_id.cloned()))
    }

    pub(crate) fn commit_key(&self, key: ReservationKey) -> Result<()> {
        let mut guard = self.write();
        let record = guard.reservations.remove(key).ok_or_else(|| Error::not_found("Quota reservation", format!("{:?}", key)))?;
        guard.apply(&record, true);
        log::debug!("QuotaLedger: committed reservation {}", record.token);
        Ok(())
    }

    pub(crate) fn rollback_key(&self, key: ReservationKey) -> Result<()> {
        let mut guard = self.write();
        let record = guard.reservations.remove(key).ok_or_else(|| Error::not_found("Quota reservation", format!("{:?}", key)))?;
        guard.apply(&record, false);
        log::debug!("QuotaLedger: rolled back reservation {}", record.token);
        Ok(())
    }

    /// Rolls back every reservation whose expiry lies before `now`.
    pub fn expire_reservations(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.write();
        let expired: Vec<ReservationKey> =
            guard.reservations.iter().filter(|(_, record)| record.expire < now).map(|(key, _)| key).collect();

        for key in &expired {
            if let Some(record) = guard.reservations.remove(*key) {
                log::warn!("QuotaLedger: expiring reservation {} of project {}", record.token, record.project_id);
                guard.apply(&record, false);
            }
        }
        expired.len()
    }

    /// Checks absolute values (not deltas) against the project's limits.
    ///
    /// Negative values are rejected; a limit of -1 means unlimited.
    pub fn limit_check(&self, project_id: &ProjectId, values: &QuotaDeltas) -> Result<()> {
        if let Some((resource, _)) = values.iter().find(|(_, v)| **v < 0) {
            return Err(Error::InvalidRequest(format!("Quota value for {} must not be negative", resource)));
        }

        let quotas = self.project_quotas(project_id);
        let overs: Vec<QuotaResource> = values
            .iter()
            .filter(|(resource, value)| {
                let limit = quotas.get(resource).copied().unwrap_or(-1);
                limit >= 0 && limit < **value
            })
            .map(|(resource, _)| *resource)
            .collect();

        if overs.is_empty() {
            return Ok(());
        }

        let usages = values.keys().map(|r| (*r, QuotaUsage::default())).collect();
        Err(Error::OverQuota(Box::new(OverQuotaDetail { overs, quotas, usages })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(&QuotaLimits::default(), 86400)
    }

    fn deltas(entries: &[(QuotaResource, i64)]) -> QuotaDeltas {
        entries.iter().copied().collect()
    }

    #[test]
    fn negative_deltas_never_go_over() {
        let ledger = ledger();
        let project = ProjectId::new("p1");
        ledger.set_in_use(&project, None, QuotaResource::Instances, 50);

        let reservation = ledger.reserve(&deltas(&[(QuotaResource::Instances, -1)]), &project, None).unwrap();
        reservation.commit().unwrap();

        assert_eq!(ledger.usages(&project, None)[&QuotaResource::Instances].in_use, 49);
    }

    #[test]
    fn user_override_is_reported_when_tighter() {
        let ledger = ledger();
        let project = ProjectId::new("p1");
        let user = UserId::new("u1");
        ledger.set_user_limit(&project, &user, QuotaResource::Instances, 1);

        let first = ledger.reserve(&deltas(&[(QuotaResource::Instances, 1)]), &project, Some(&user)).unwrap();
        let err = ledger.reserve(&deltas(&[(QuotaResource::Instances, 1)]), &project, Some(&user)).unwrap_err();
        match err {
            Error::OverQuota(detail) => {
                assert_eq!(detail.overs, vec![QuotaResource::Instances]);
                assert_eq!(detail.quotas[&QuotaResource::Instances], 1);
                assert_eq!(detail.usages[&QuotaResource::Instances].reserved, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        first.rollback();
    }

    #[test]
    fn project_scope_is_reported_when_it_is_the_one_exceeded() {
        let ledger = ledger();
        let project = ProjectId::new("p1");
        let user = UserId::new("u1");
        ledger.set_user_limit(&project, &user, QuotaResource::Cores, 100);
        ledger.set_in_use(&project, None, QuotaResource::Instances, 9);

        let err = ledger.reserve(&deltas(&[(QuotaResource::Instances, 2)]), &project, Some(&user)).unwrap_err();
        match err {
            Error::OverQuota(detail) => {
                assert_eq!(detail.overs, vec![QuotaResource::Instances]);
                assert_eq!(detail.quotas[&QuotaResource::Instances], 10);
                assert_eq!(detail.usages[&QuotaResource::Instances].in_use, 9);
                assert_eq!(detail.quotas[&QuotaResource::Cores], 100);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn absolute_resources_cannot_be_reserved() {
        let err = ledger()
            .reserve(&deltas(&[(QuotaResource::MetadataItems, 1)]), &ProjectId::new("p1"), None)
            .unwrap_err();
        assert!(matches!(err, Error::QuotaResourceUnknown(_)));
    }

    #[test]
    fn expired_reservations_release_their_hold() {
        let ledger = QuotaLedger::new(&QuotaLimits::default(), 0);
        let project = ProjectId::new("p1");
        let reservation = ledger.reserve(&deltas(&[(QuotaResource::Cores, 4)]), &project, None).unwrap();

        assert_eq!(ledger.expire_reservations(Utc::now() + Duration::seconds(1)), 1);
        assert_eq!(ledger.usages(&project, None)[&QuotaResource::Cores].reserved, 0);
        assert!(reservation.commit().is_err());
    }
}

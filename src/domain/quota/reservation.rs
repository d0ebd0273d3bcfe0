use crate::domain::quota::ledger::{QuotaDeltas, QuotaLedger, ReservationKey};
use crate::domain::utils::id::{ProjectId, UserId};
use crate::error::Result;

/// Handle to a pending ledger reservation.
///
/// `commit` and `rollback` consume the handle, so a reservation can be
/// terminated at most once. A handle dropped while still pending is rolled
/// back and reported as an error in the log.
#[derive(Debug)]
pub struct QuotaReservation {
    ledger: Option<QuotaLedger>,
    key: Option<ReservationKey>,
    token: String,
    deltas: QuotaDeltas,
    project_id: Option<ProjectId>,
    user_id: Option<UserId>,
}

impl QuotaReservation {
    pub(crate) fn new(
        ledger: QuotaLedger,
        key: ReservationKey,
        token: String,
        deltas: QuotaDeltas,
        project_id: ProjectId,
        user_id: Option<UserId>,
    ) -> Self {
        Self { ledger: Some(ledger), key: Some(key), token, deltas, project_id: Some(project_id), user_id }
    }

    /// A reservation that holds nothing; commit and rollback are no-ops.
    pub fn empty() -> Self {
        Self { ledger: None, key: None, token: String::new(), deltas: QuotaDeltas::new(), project_id: None, user_id: None }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn deltas(&self) -> &QuotaDeltas {
        &self.deltas
    }

    pub fn project_id(&self) -> Option<&ProjectId> {
        self.project_id.as_ref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn commit(mut self) -> Result<()> {
        match (self.ledger.take(), self.key.take()) {
            (Some(ledger), Some(key)) => ledger.commit_key(key),
            _ => Ok(()),
        }
    }

    /// Releases the hold. Failures are logged; there is nothing left for the
    /// caller to undo.
    pub fn rollback(mut self) {
        if let (Some(ledger), Some(key)) = (self.ledger.take(), self.key.take()) {
            if let Err(e) = ledger.rollback_key(key) {
                log::warn!("QuotaLedger: failed to roll back reservation {}: {}", self.token, e);
            }
        }
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if let (Some(ledger), Some(key)) = (self.ledger.take(), self.key.take()) {
            log::error!(
                "QuotaLedger: reservation {} of project {:?} dropped without commit or rollback; rolling back",
                self.token,
                self.project_id
            );
            if let Err(e) = ledger.rollback_key(key) {
                log::warn!("QuotaLedger: failed to roll back reservation {}: {}", self.token, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::QuotaLimits;
    use crate::domain::quota::resource::QuotaResource;

    #[test]
    fn dropped_reservation_is_rolled_back() {
        let ledger = QuotaLedger::new(&QuotaLimits::default(), 86400);
        let project = ProjectId::new("p1");
        let deltas: QuotaDeltas = [(QuotaResource::Instances, 2)].into_iter().collect();

        {
            let _reservation = ledger.reserve(&deltas, &project, None).unwrap();
            assert_eq!(ledger.usages(&project, None)[&QuotaResource::Instances].reserved, 2);
        }

        assert_eq!(ledger.pending_reservations(), 0);
        let usage = ledger.usages(&project, None)[&QuotaResource::Instances];
        assert_eq!((usage.in_use, usage.reserved), (0, 0));
    }

    #[test]
    fn empty_reservation_is_inert() {
        let reservation = QuotaReservation::empty();
        assert!(reservation.is_empty());
        assert!(reservation.commit().is_ok());
    }
}

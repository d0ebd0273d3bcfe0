pub mod deltas;
pub mod headroom;
pub mod ledger;
pub mod reservation;
pub mod resource;

pub use ledger::{QuotaDeltas, QuotaLedger, QuotaUsage};
pub use reservation::QuotaReservation;
pub use resource::QuotaResource;

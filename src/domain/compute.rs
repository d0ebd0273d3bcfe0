//! The instance lifecycle: creation pipeline and the guarded operations on
//! existing instances. Every operation is a method of [`ComputeApi`].

pub mod admission;
pub mod compute_api;
pub mod creation;
pub mod delete;
pub mod guard;
pub mod lifecycle;
pub mod metadata;
pub mod notifications;
pub mod power;
pub mod resize;
pub mod volumes;

pub use compute_api::{Collaborators, ComputeApi};
pub use creation::{AvailabilityZoneTarget, CreateRequest};
pub use lifecycle::RebuildRequest;

//! Collaborators the orchestrator talks to. Each is a trait injected at
//! construction, with an in-memory backend usable for tests and local runs.

pub mod compute_rpc;
pub mod conductor;
pub mod flavor_catalog;
pub mod image;
pub mod key_pair;
pub mod network;
pub mod security_group;
pub mod server_group;
pub mod service_group;
pub mod volume;

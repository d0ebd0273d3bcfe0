pub mod build_request;
pub mod cell_database;
pub mod cell_resolver;
pub mod instance_mapping;
pub mod placement_store;

pub use build_request::BuildRequest;
pub use cell_database::CellDatabase;
pub use cell_resolver::CellAwareResolver;
pub use instance_mapping::InstanceMapping;
pub use placement_store::PlacementStore;

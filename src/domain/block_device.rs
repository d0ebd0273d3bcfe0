pub mod legacy;
pub mod mapping;
pub mod resolver;

pub use mapping::BlockDeviceMapping;
pub use resolver::{BlockDeviceRequest, StorageTopologyResolver};

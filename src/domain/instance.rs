pub mod flavor;
#[allow(clippy::module_inception)]
pub mod instance;
pub mod migration;
pub mod resources;
pub mod vm_state;

pub mod block_device;
pub mod compute;
pub mod config;
pub mod context;
pub mod instance;
pub mod placement;
pub mod quota;
pub mod services;
pub mod utils;

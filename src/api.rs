pub mod block_device_dto;
pub mod config_dto;

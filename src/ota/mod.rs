// OTA adapters: flash slots, first-boot self-test and the upload server

pub mod partitions;
pub mod transfer_server;

pub use partitions::EspPartitions;
pub use transfer_server::HttpTransferService;

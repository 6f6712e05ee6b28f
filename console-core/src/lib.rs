//! Console Core - Hardware-independent OTA update pipeline for the driver console
//!
//! This crate contains the update logic that can be tested on the host platform
//! without requiring ESP32 hardware. The firmware crate supplies the platform
//! adapters (Wi-Fi driver, BLE control radio, OTA partitions, task watchdog).
//!
//! Pipeline, leaves first:
//! bridge -> wifi -> transfer -> orchestrator -> validator

pub mod bridge;
pub mod config;
pub mod digest;
pub mod error;
pub mod orchestrator;
pub mod partition;
pub mod platform;
pub mod state;
pub mod transfer;
pub mod validator;
pub mod wifi;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{ControlRequest, Credentials, OtaBridge, ProgressEvent, ProvisioningEvent};
pub use config::{Language, OtaConfig};
pub use error::ErrorCode;
pub use orchestrator::UpdateOrchestrator;
pub use partition::{PartitionHandle, UpdatePartitions};
pub use platform::{ControlRadio, SystemControl};
pub use state::OtaState;
pub use transfer::{
    TransferEndpoint, TransferError, TransferLink, TransferPhase, TransferService,
    TransferSnapshot,
};
pub use validator::{PostUpdateValidator, ProbeError, SelfTestOutcome, SubsystemProbe, Watchdog};
pub use wifi::{LinkEvent, WifiDriver, WifiError, WifiModule};
pub use wire::StatusPacket;

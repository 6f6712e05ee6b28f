/// OTA tunables that can be tested independently of the NVS layer
use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacity of the provisioning event ring. A compile-time constant because it
/// sizes the bridge's static channel.
pub const PROVISIONING_QUEUE_CAPACITY: usize = 8;

/// Upper bound for a single transfer chunk; keeps the heap buffer small
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    English,
    German,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// Bytes read from the upload body and written to flash per step
    pub chunk_size: usize,
    /// Period of the main loop that ticks the orchestrator
    pub tick_interval_ms: u32,
    /// How long `ConnectingWifi` may last before `Failed(WifiTimeout)`
    pub wifi_connect_timeout_secs: u32,
    /// Association attempts inside the Wi-Fi module before it reports failure
    pub wifi_max_attempts: u8,
    pub radio_disable_timeout_ms: u32,
    pub server_start_timeout_ms: u32,
    /// How long to wait for the companion app to begin the upload
    pub firmware_wait_timeout_secs: u32,
    /// Maximum gap between two progress events while `Receiving`
    pub chunk_inactivity_timeout_secs: u32,
    pub verify_timeout_secs: u32,
    /// Grace period in `Rebooting` so the HTTP response reaches the client
    pub reboot_delay_ms: u32,
    /// Hardware watchdog deadline for the post-update self-test
    pub self_test_budget_secs: u32,
    pub language: Language,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            tick_interval_ms: 50,
            wifi_connect_timeout_secs: 30,
            wifi_max_attempts: 5,
            radio_disable_timeout_ms: 5_000,
            server_start_timeout_ms: 5_000,
            firmware_wait_timeout_secs: 300,
            chunk_inactivity_timeout_secs: 15,
            verify_timeout_secs: 10,
            reboot_delay_ms: 2_000,
            self_test_budget_secs: 60,
            language: Language::English,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ChunkSize(usize),
    ZeroBudget(&'static str),
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ChunkSize(size) => {
                write!(f, "chunk size {} outside 512..={}", size, MAX_CHUNK_SIZE)
            }
            ConfigError::ZeroBudget(name) => write!(f, "{} must be non-zero", name),
            ConfigError::Malformed(msg) => write!(f, "malformed OTA config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl OtaConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: OtaConfig =
            serde_json::from_slice(bytes).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Plain struct of integers and a unit enum; serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(512..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        let budgets = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("wifi_connect_timeout_secs", self.wifi_connect_timeout_secs),
            ("wifi_max_attempts", self.wifi_max_attempts as u32),
            ("radio_disable_timeout_ms", self.radio_disable_timeout_ms),
            ("server_start_timeout_ms", self.server_start_timeout_ms),
            ("firmware_wait_timeout_secs", self.firmware_wait_timeout_secs),
            ("chunk_inactivity_timeout_secs", self.chunk_inactivity_timeout_secs),
            ("verify_timeout_secs", self.verify_timeout_secs),
            ("self_test_budget_secs", self.self_test_budget_secs),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(ConfigError::ZeroBudget(name));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms as u64)
    }

    pub fn wifi_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.wifi_connect_timeout_secs as u64)
    }

    pub fn radio_disable_timeout(&self) -> Duration {
        Duration::from_millis(self.radio_disable_timeout_ms as u64)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_millis(self.server_start_timeout_ms as u64)
    }

    pub fn firmware_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.firmware_wait_timeout_secs as u64)
    }

    pub fn chunk_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_inactivity_timeout_secs as u64)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs as u64)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms as u64)
    }

    pub fn self_test_budget(&self) -> Duration {
        Duration::from_secs(self.self_test_budget_secs as u64)
    }
}

use anyhow::Result;
use console_core::OtaConfig;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

const CONFIG_NAMESPACE: &str = "console";
const CONFIG_KEY: &str = "ota";
const LOG_LEVEL_KEY: &str = "log_level";
const ROLLBACK_KEY: &str = "rb_reported";

/// OTA tunables and the serial log level, persisted in NVS. Wi-Fi
/// credentials are never stored here.
pub struct ConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl ConfigStore {
    pub fn open(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    /// Stored config, or the defaults when it is missing or fails validation
    pub fn load_or_default(&mut self) -> OtaConfig {
        match self.load() {
            Ok(Some(config)) => {
                log::info!("Loaded OTA configuration from NVS");
                config
            }
            Ok(None) => {
                log::info!("No OTA configuration in NVS, using defaults");
                let config = OtaConfig::default();
                if let Err(e) = self.save(&config) {
                    log::warn!("Failed to save default OTA config to NVS: {:?}", e);
                }
                config
            }
            Err(e) => {
                log::warn!("Stored OTA config rejected ({:?}), using defaults", e);
                OtaConfig::default()
            }
        }
    }

    fn load(&mut self) -> Result<Option<OtaConfig>> {
        let mut buf = vec![0u8; 1024];
        let Some(data) = self.nvs.get_blob(CONFIG_KEY, &mut buf)? else {
            return Ok(None);
        };
        Ok(Some(OtaConfig::from_json(data)?))
    }

    pub fn save(&mut self, config: &OtaConfig) -> Result<()> {
        self.nvs.set_blob(CONFIG_KEY, &config.to_json())?;
        log::info!("OTA configuration saved to NVS");
        Ok(())
    }

    /// A rolled-back update has already been shown to the user
    pub fn rollback_reported(&self) -> bool {
        matches!(self.nvs.get_u8(ROLLBACK_KEY), Ok(Some(1)))
    }

    pub fn set_rollback_reported(&mut self, reported: bool) -> Result<()> {
        self.nvs.set_u8(ROLLBACK_KEY, u8::from(reported))?;
        Ok(())
    }

    pub fn log_level(&self) -> Option<String> {
        let mut buf = [0u8; 16];
        match self.nvs.get_str(LOG_LEVEL_KEY, &mut buf) {
            Ok(level) => level.map(str::to_owned),
            Err(e) => {
                log::debug!("No stored log level: {:?}", e);
                None
            }
        }
    }
}

use esp_idf_sys::{
    esp_reset_reason, esp_reset_reason_t_ESP_RST_BROWNOUT as RST_BROWNOUT,
    esp_reset_reason_t_ESP_RST_DEEPSLEEP as RST_DEEPSLEEP, esp_reset_reason_t_ESP_RST_EXT as RST_EXT,
    esp_reset_reason_t_ESP_RST_INT_WDT as RST_INT_WDT, esp_reset_reason_t_ESP_RST_PANIC as RST_PANIC,
    esp_reset_reason_t_ESP_RST_POWERON as RST_POWERON, esp_reset_reason_t_ESP_RST_SW as RST_SW,
    esp_reset_reason_t_ESP_RST_TASK_WDT as RST_TASK_WDT, esp_reset_reason_t_ESP_RST_WDT as RST_WDT,
};

/// Why the previous boot ended, as far as the update path cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootCause {
    PowerOn,
    ExternalPin,
    /// Includes the restart issued after a successful update
    Software,
    DeepSleep,
    Brownout,
    Panic,
    Watchdog(&'static str),
    Other(u32),
}

impl BootCause {
    pub fn read() -> Self {
        match unsafe { esp_reset_reason() } {
            RST_POWERON => Self::PowerOn,
            RST_EXT => Self::ExternalPin,
            RST_SW => Self::Software,
            RST_DEEPSLEEP => Self::DeepSleep,
            RST_BROWNOUT => Self::Brownout,
            RST_PANIC => Self::Panic,
            RST_INT_WDT => Self::Watchdog("interrupt"),
            RST_TASK_WDT => Self::Watchdog("task"),
            RST_WDT => Self::Watchdog("other"),
            code => Self::Other(code),
        }
    }

    /// A crash or watchdog. If that boot was a pending-verify image the
    /// bootloader has already switched back to the previous slot.
    pub fn is_abnormal(self) -> bool {
        matches!(self, Self::Panic | Self::Watchdog(_))
    }
}

impl core::fmt::Display for BootCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PowerOn => write!(f, "Power-on"),
            Self::ExternalPin => write!(f, "External pin"),
            Self::Software => write!(f, "Software reset"),
            Self::DeepSleep => write!(f, "Deep sleep"),
            Self::Brownout => write!(f, "Brownout"),
            Self::Panic => write!(f, "Panic"),
            Self::Watchdog(kind) => write!(f, "Watchdog ({})", kind),
            Self::Other(code) => write!(f, "Reset code {}", code),
        }
    }
}

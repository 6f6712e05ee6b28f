/// Orchestrator state and the edges it is allowed to take
use core::fmt;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    ConnectingWifi,
    WifiConnected,
    DisablingRadio,
    StartingTransferServer,
    WaitingForFirmware,
    Receiving,
    Verifying,
    Rebooting,
    Failed(ErrorCode),
}

/// Status-frame tag for `Failed`; the reason travels in the error byte
pub const FAILED_TAG: u8 = 0xFF;

impl OtaState {
    /// Position along the success path; `None` for `Failed`
    pub fn stage(&self) -> Option<u8> {
        match self {
            OtaState::Idle => Some(0),
            OtaState::ConnectingWifi => Some(1),
            OtaState::WifiConnected => Some(2),
            OtaState::DisablingRadio => Some(3),
            OtaState::StartingTransferServer => Some(4),
            OtaState::WaitingForFirmware => Some(5),
            OtaState::Receiving => Some(6),
            OtaState::Verifying => Some(7),
            OtaState::Rebooting => Some(8),
            OtaState::Failed(_) => None,
        }
    }

    pub fn tag(&self) -> u8 {
        self.stage().unwrap_or(FAILED_TAG)
    }

    pub fn from_tag(tag: u8, error: Option<ErrorCode>) -> Option<Self> {
        let state = match tag {
            0 => OtaState::Idle,
            1 => OtaState::ConnectingWifi,
            2 => OtaState::WifiConnected,
            3 => OtaState::DisablingRadio,
            4 => OtaState::StartingTransferServer,
            5 => OtaState::WaitingForFirmware,
            6 => OtaState::Receiving,
            7 => OtaState::Verifying,
            8 => OtaState::Rebooting,
            FAILED_TAG => OtaState::Failed(error?),
            _ => return None,
        };
        Some(state)
    }

    pub fn error(&self) -> Option<ErrorCode> {
        match self {
            OtaState::Failed(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OtaState::Failed(_))
    }

    /// An update attempt is in flight: abort requests apply and late
    /// credentials are dropped.
    pub fn is_busy(&self) -> bool {
        !matches!(self, OtaState::Idle | OtaState::Failed(_))
    }

    /// An abort still leaves the running firmware as the boot target. Not
    /// the case once `Rebooting`: the verified image is already armed.
    pub fn is_abortable(&self) -> bool {
        self.is_busy() && *self != OtaState::Rebooting
    }

    /// Success path moves exactly one stage forward; every non-terminal stage
    /// may fail; `Failed` only returns to `Idle`.
    pub fn can_transition_to(&self, next: OtaState) -> bool {
        match (self, next) {
            (OtaState::Failed(_), OtaState::Idle) => true,
            (OtaState::Failed(_), _) => false,
            (_, OtaState::Failed(_)) => true,
            (current, next) => match (current.stage(), next.stage()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OtaState::Idle => "Idle",
            OtaState::ConnectingWifi => "ConnectingWifi",
            OtaState::WifiConnected => "WifiConnected",
            OtaState::DisablingRadio => "DisablingRadio",
            OtaState::StartingTransferServer => "StartingTransferServer",
            OtaState::WaitingForFirmware => "WaitingForFirmware",
            OtaState::Receiving => "Receiving",
            OtaState::Verifying => "Verifying",
            OtaState::Rebooting => "Rebooting",
            OtaState::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaState::Failed(code) => write!(f, "Failed({})", code),
            other => f.write_str(other.label()),
        }
    }
}

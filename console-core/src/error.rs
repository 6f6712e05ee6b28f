/// OTA error taxonomy shared by every stage of the update pipeline
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Language;

/// Terminal failure reasons. The numeric value is the error byte of the
/// status frame sent over the provisioning channel; 0 means "no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    WifiTimeout = 1,
    WifiAssociationFailed = 2,
    TransferRejected = 3,
    TransferInterrupted = 4,
    IntegrityCheckFailed = 5,
    PartitionWriteFailed = 6,
    Aborted = 7,
    SelfTestFailed = 8,
    RadioDisableFailed = 9,
    ServerStartFailed = 10,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::WifiTimeout,
        ErrorCode::WifiAssociationFailed,
        ErrorCode::TransferRejected,
        ErrorCode::TransferInterrupted,
        ErrorCode::IntegrityCheckFailed,
        ErrorCode::PartitionWriteFailed,
        ErrorCode::Aborted,
        ErrorCode::SelfTestFailed,
        ErrorCode::RadioDisableFailed,
        ErrorCode::ServerStartFailed,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_u8() == value)
    }

    /// Short message for the console screen, in the driver's language
    pub fn message(self, language: Language) -> &'static str {
        match language {
            Language::English => match self {
                ErrorCode::WifiTimeout => "Could not join the Wi-Fi network",
                ErrorCode::WifiAssociationFailed => "Wi-Fi credentials were rejected",
                ErrorCode::TransferRejected => "Update file was rejected",
                ErrorCode::TransferInterrupted => "Update transfer was interrupted",
                ErrorCode::IntegrityCheckFailed => "Update file is corrupted",
                ErrorCode::PartitionWriteFailed => "Could not write the update to flash",
                ErrorCode::Aborted => "Update cancelled",
                ErrorCode::SelfTestFailed => "New firmware failed its self-test",
                ErrorCode::RadioDisableFailed => "Bluetooth could not be switched off",
                ErrorCode::ServerStartFailed => "Update server could not start",
            },
            Language::German => match self {
                ErrorCode::WifiTimeout => "WLAN-Verbindung fehlgeschlagen",
                ErrorCode::WifiAssociationFailed => "WLAN-Zugangsdaten abgelehnt",
                ErrorCode::TransferRejected => "Update-Datei abgelehnt",
                ErrorCode::TransferInterrupted => "Update-Übertragung unterbrochen",
                ErrorCode::IntegrityCheckFailed => "Update-Datei beschädigt",
                ErrorCode::PartitionWriteFailed => "Update konnte nicht gespeichert werden",
                ErrorCode::Aborted => "Update abgebrochen",
                ErrorCode::SelfTestFailed => "Selbsttest der neuen Firmware fehlgeschlagen",
                ErrorCode::RadioDisableFailed => "Bluetooth konnte nicht abgeschaltet werden",
                ErrorCode::ServerStartFailed => "Update-Server konnte nicht starten",
            },
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::WifiTimeout => "wifi timeout",
            ErrorCode::WifiAssociationFailed => "wifi association failed",
            ErrorCode::TransferRejected => "transfer rejected",
            ErrorCode::TransferInterrupted => "transfer interrupted",
            ErrorCode::IntegrityCheckFailed => "integrity check failed",
            ErrorCode::PartitionWriteFailed => "partition write failed",
            ErrorCode::Aborted => "aborted",
            ErrorCode::SelfTestFailed => "self-test failed",
            ErrorCode::RadioDisableFailed => "radio disable failed",
            ErrorCode::ServerStartFailed => "transfer server start failed",
        };
        f.write_str(name)
    }
}

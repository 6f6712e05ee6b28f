//! Credential & progress bridge
//!
//! One-way, non-blocking hand-off from foreign scheduling contexts (BLE GATT
//! callbacks, the HTTP server task, the input layer) to the orchestrator loop.
//! Producers never block and never take a lock the main loop holds:
//!
//! - provisioning events go through a fixed-capacity FIFO; a full queue drops
//!   the new event and reports `false` to the producer
//! - progress is a gauge: the latest value overwrites any unread one

use core::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::config::PROVISIONING_QUEUE_CAPACITY;
use crate::wire::{decode_credentials, WireError};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsError {
    EmptySsid,
    SsidTooLong(usize),
    SecretTooLong(usize),
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsError::EmptySsid => write!(f, "network name is empty"),
            CredentialsError::SsidTooLong(len) => {
                write!(f, "network name is {} bytes (max {})", len, MAX_SSID_LEN)
            }
            CredentialsError::SecretTooLong(len) => {
                write!(f, "secret is {} bytes (max {})", len, MAX_SECRET_LEN)
            }
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Check network name and secret against the station-mode limits
pub fn validate_lengths(ssid: &[u8], secret: &[u8]) -> Result<(), CredentialsError> {
    if ssid.is_empty() {
        return Err(CredentialsError::EmptySsid);
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(CredentialsError::SsidTooLong(ssid.len()));
    }
    if secret.len() > MAX_SECRET_LEN {
        return Err(CredentialsError::SecretTooLong(secret.len()));
    }
    Ok(())
}

/// Wi-Fi network name and secret. Lives only for one update attempt and is
/// never persisted; `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: heapless::Vec<u8, MAX_SSID_LEN>,
    secret: heapless::Vec<u8, MAX_SECRET_LEN>,
}

impl Credentials {
    pub fn new(ssid: &[u8], secret: &[u8]) -> Result<Self, CredentialsError> {
        validate_lengths(ssid, secret)?;
        let ssid = heapless::Vec::from_slice(ssid)
            .map_err(|_| CredentialsError::SsidTooLong(ssid.len()))?;
        let secret = heapless::Vec::from_slice(secret)
            .map_err(|_| CredentialsError::SecretTooLong(secret.len()))?;
        Ok(Self { ssid, secret })
    }

    pub fn ssid(&self) -> &[u8] {
        &self.ssid
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Open networks carry an empty secret
    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid_len", &self.ssid.len())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    CredentialsReceived(Credentials),
    Control(ControlRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_received: u32,
    pub bytes_total: u32,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(bytes_received: u32, bytes_total: u32) -> Self {
        let percent = if bytes_total == 0 {
            0
        } else {
            ((bytes_received as u64 * 100) / bytes_total as u64).min(100) as u8
        };
        Self {
            bytes_received,
            bytes_total,
            percent,
        }
    }
}

pub struct OtaBridge {
    events: Channel<CriticalSectionRawMutex, ProvisioningEvent, PROVISIONING_QUEUE_CAPACITY>,
    progress: Signal<CriticalSectionRawMutex, ProgressEvent>,
}

impl OtaBridge {
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
            progress: Signal::new(),
        }
    }

    /// Non-blocking enqueue. Returns `false` and drops `event` when the queue
    /// is full; callers must not spin on a retry.
    pub fn post_provisioning_event(&self, event: ProvisioningEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("Provisioning queue full, event dropped");
                false
            }
        }
    }

    /// Entry point for the credential characteristic: decode a versioned
    /// frame and queue it. `Ok(false)` when the queue was full.
    pub fn post_credential_frame(&self, frame: &[u8]) -> Result<bool, WireError> {
        let credentials = decode_credentials(frame)?;
        Ok(self.post_provisioning_event(ProvisioningEvent::CredentialsReceived(
            credentials,
        )))
    }

    /// Everything queued at call time, oldest first. Single consumer only.
    pub fn drain_provisioning_events(
        &self,
    ) -> heapless::Vec<ProvisioningEvent, PROVISIONING_QUEUE_CAPACITY> {
        let mut drained = heapless::Vec::new();
        // Stop at one ring's worth so events posted mid-drain wait for the
        // next tick instead of being lost.
        while !drained.is_full() {
            match self.events.try_receive() {
                Ok(event) => {
                    let _ = drained.push(event);
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Overwrites any unread progress value. Never fails, never blocks.
    pub fn post_progress(&self, event: ProgressEvent) {
        self.progress.signal(event);
    }

    /// Latest progress value, clearing it
    pub fn take_progress(&self) -> Option<ProgressEvent> {
        self.progress.try_take()
    }
}

impl Default for OtaBridge {
    fn default() -> Self {
        Self::new()
    }
}

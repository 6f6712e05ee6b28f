//! Wi-Fi connection module
//!
//! Non-blocking station bring-up. `connect` only issues the request; the
//! orchestrator then polls `poll_connected` / `poll_failed` every tick. Link
//! events come from the platform driver through `WifiDriver::poll_event`, so
//! nothing here ever waits on the radio.

use core::fmt;
use std::net::Ipv4Addr;

use crate::bridge::{validate_lengths, Credentials, CredentialsError};

/// Link-layer events reported by the platform driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Associated,
    GotIp(Ipv4Addr),
    Disconnected,
}

/// Station-mode radio as provided by the platform
pub trait WifiDriver {
    type Error: fmt::Debug + fmt::Display;

    fn configure(&mut self, credentials: &Credentials) -> Result<(), Self::Error>;

    /// Issue an association request and return at once
    fn begin_connect(&mut self) -> Result<(), Self::Error>;

    fn poll_event(&mut self) -> Option<LinkEvent>;

    /// Deregister handlers, stop the radio and free the interface. Must be
    /// safe to call in any state, including before `configure`.
    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiError {
    InvalidCredentials(CredentialsError),
    AlreadyActive,
    Driver(String),
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WifiError::InvalidCredentials(e) => write!(f, "invalid credentials: {}", e),
            WifiError::AlreadyActive => write!(f, "connection attempt already in progress"),
            WifiError::Driver(msg) => write!(f, "wifi driver error: {}", msg),
        }
    }
}

impl std::error::Error for WifiError {}

impl From<CredentialsError> for WifiError {
    fn from(e: CredentialsError) -> Self {
        WifiError::InvalidCredentials(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Down,
    Connecting { attempt: u8 },
    Associated { attempt: u8 },
    Up(Ipv4Addr),
    Exhausted,
}

pub struct WifiModule<D: WifiDriver> {
    driver: D,
    max_attempts: u8,
    state: LinkState,
    failure_reported: bool,
}

impl<D: WifiDriver> WifiModule<D> {
    pub fn new(driver: D, max_attempts: u8) -> Self {
        Self {
            driver,
            max_attempts: max_attempts.max(1),
            state: LinkState::Down,
            failure_reported: false,
        }
    }

    /// Validate, configure and start associating. Returns immediately.
    pub fn connect(&mut self, ssid: &[u8], password: &[u8]) -> Result<(), WifiError> {
        validate_lengths(ssid, password)?;
        if !matches!(self.state, LinkState::Down | LinkState::Exhausted) {
            return Err(WifiError::AlreadyActive);
        }
        let credentials = Credentials::new(ssid, password)?;

        log::info!(
            "WiFi: connecting (ssid {} bytes, {})",
            ssid.len(),
            if credentials.is_open() { "open" } else { "WPA2" }
        );
        self.driver
            .configure(&credentials)
            .map_err(|e| WifiError::Driver(e.to_string()))?;
        self.driver
            .begin_connect()
            .map_err(|e| WifiError::Driver(e.to_string()))?;

        self.state = LinkState::Connecting { attempt: 1 };
        self.failure_reported = false;
        Ok(())
    }

    /// Address once DHCP completed
    pub fn poll_connected(&mut self) -> Option<Ipv4Addr> {
        self.pump();
        match self.state {
            LinkState::Up(ip) => Some(ip),
            _ => None,
        }
    }

    /// True once per attempt, after the retry budget is spent
    pub fn poll_failed(&mut self) -> bool {
        self.pump();
        if self.state == LinkState::Exhausted && !self.failure_reported {
            self.failure_reported = true;
            return true;
        }
        false
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state,
            LinkState::Connecting { .. } | LinkState::Associated { .. }
        )
    }

    /// Tear down the station. Safe when never connected.
    pub fn shutdown(&mut self) {
        if self.state != LinkState::Down {
            log::info!("WiFi: shutting down station");
        }
        self.driver.release();
        self.state = LinkState::Down;
        self.failure_reported = false;
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn pump(&mut self) {
        while let Some(event) = self.driver.poll_event() {
            self.on_event(event);
        }
    }

    fn on_event(&mut self, event: LinkEvent) {
        self.state = match (self.state, event) {
            (LinkState::Connecting { attempt }, LinkEvent::Associated) => {
                log::debug!("WiFi: associated, waiting for DHCP");
                LinkState::Associated { attempt }
            }
            (LinkState::Connecting { .. } | LinkState::Associated { .. }, LinkEvent::GotIp(ip)) => {
                log::info!("WiFi: connected, address {}", ip);
                LinkState::Up(ip)
            }
            (
                LinkState::Connecting { attempt } | LinkState::Associated { attempt },
                LinkEvent::Disconnected,
            ) => self.retry(attempt),
            (LinkState::Up(_), LinkEvent::Disconnected) => {
                log::warn!("WiFi: link lost after connect, reassociating");
                self.retry(0)
            }
            (state, _) => state,
        };
    }

    fn retry(&mut self, attempt: u8) -> LinkState {
        if attempt >= self.max_attempts {
            log::error!("WiFi: association failed after {} attempts", attempt);
            return LinkState::Exhausted;
        }
        let next = attempt + 1;
        log::warn!("WiFi: association attempt {}/{}", next, self.max_attempts);
        match self.driver.begin_connect() {
            Ok(()) => LinkState::Connecting { attempt: next },
            Err(e) => {
                log::warn!("WiFi: reconnect request failed: {}", e);
                self.retry(next)
            }
        }
    }
}

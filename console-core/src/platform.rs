/// Seams to the rest of the console: control radio and system reset
use core::fmt;
use std::net::Ipv4Addr;

use crate::wire::StatusPacket;

/// The provisioning radio (BLE GATT on the device). Must be switched off
/// before the transfer server comes up; the two never run together.
pub trait ControlRadio {
    type Error: fmt::Debug + fmt::Display;

    /// Update the status characteristic and notify subscribers
    fn publish_status(&mut self, status: &StatusPacket);

    /// Update the address characteristic and notify subscribers
    fn publish_address(&mut self, address: Ipv4Addr);

    /// Start switching the radio off. Completion is observed with
    /// `is_disabled`.
    fn request_disable(&mut self) -> Result<(), Self::Error>;

    fn is_disabled(&self) -> bool;

    fn enable(&mut self) -> Result<(), Self::Error>;
}

pub trait SystemControl {
    /// Reboot the device. On hardware this does not return.
    fn restart(&mut self);
}

//! Host-based tests for the driver console update pipeline
//! These tests run on the development machine, not on the ESP32.
//!
//! `sim` stands in for the flash/bootloader, radios, watchdog and system
//! reset; `scenarios` drives complete update attempts through them.

pub mod sim;

#[cfg(test)]
mod scenarios;

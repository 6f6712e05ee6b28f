// Test doubles shared by the unit tests of this crate

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Credentials;
use crate::partition::{PartitionHandle, UpdatePartitions};
use crate::platform::{ControlRadio, SystemControl};
use crate::transfer::{TransferLink, TransferPhase, TransferService};
use crate::validator::Watchdog;
use crate::wifi::{LinkEvent, WifiDriver};
use crate::wire::StatusPacket;

/// Deterministic, non-repeating test image
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

#[derive(Debug, Default)]
pub struct FakeWifi {
    pub events: VecDeque<LinkEvent>,
    pub configured: Option<Credentials>,
    pub connect_requests: u32,
    pub releases: u32,
    pub fail_configure: bool,
}

impl FakeWifi {
    pub fn failing_configure() -> Self {
        Self {
            fail_configure: true,
            ..Self::default()
        }
    }

    pub fn push(&mut self, event: LinkEvent) {
        self.events.push_back(event);
    }
}

impl WifiDriver for FakeWifi {
    type Error = String;

    fn configure(&mut self, credentials: &Credentials) -> Result<(), String> {
        if self.fail_configure {
            return Err("configure failed".to_string());
        }
        self.configured = Some(credentials.clone());
        Ok(())
    }

    fn begin_connect(&mut self) -> Result<(), String> {
        self.connect_requests += 1;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn release(&mut self) {
        self.releases += 1;
        self.configured = None;
    }
}

/// Two app slots; slot 0 is running
#[derive(Debug)]
pub struct FakePartitions {
    slots: [Vec<u8>; 2],
    capacity: u32,
    running: usize,
    boot_candidate: Option<usize>,
    pub pending_verify: bool,
    pub marked_valid: bool,
    pub marked_invalid: bool,
    pub begin_calls: u32,
    pub invalidated: u32,
    pub written_bytes: u32,
    pub running_writes: u32,
    pub fail_write_at: Option<u32>,
    pub misreport_inactive: bool,
    pub inactive_rejected: bool,
}

impl FakePartitions {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: [vec![0xFF; capacity as usize], vec![0xFF; capacity as usize]],
            capacity,
            running: 0,
            boot_candidate: None,
            pending_verify: false,
            marked_valid: false,
            marked_invalid: false,
            begin_calls: 0,
            invalidated: 0,
            written_bytes: 0,
            running_writes: 0,
            fail_write_at: None,
            misreport_inactive: false,
            inactive_rejected: false,
        }
    }

    pub fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index]
    }

    pub fn boot_candidate(&self) -> Option<usize> {
        self.boot_candidate
    }

    fn handle(&self, index: usize) -> PartitionHandle {
        let label = if index == 0 { "ota_0" } else { "ota_1" };
        PartitionHandle::new(label, 0x10000 + index as u32 * self.capacity, self.capacity)
    }

    fn index_of(&self, handle: &PartitionHandle) -> Result<usize, String> {
        (0..2)
            .find(|i| self.handle(*i) == *handle)
            .ok_or_else(|| format!("unknown partition {}", handle.label))
    }
}

impl UpdatePartitions for FakePartitions {
    type Error = String;

    fn running_partition(&self) -> Result<PartitionHandle, String> {
        Ok(self.handle(self.running))
    }

    fn inactive_partition(&mut self) -> Result<PartitionHandle, String> {
        if self.misreport_inactive {
            return Ok(self.handle(self.running));
        }
        Ok(self.handle(1 - self.running))
    }

    fn begin_write(&mut self, handle: &PartitionHandle, _image_size: u32) -> Result<(), String> {
        self.begin_calls += 1;
        let index = self.index_of(handle)?;
        if index == self.running {
            self.running_writes += 1;
            return Err("running partition".to_string());
        }
        self.slots[index].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, handle: &PartitionHandle, offset: u32, bytes: &[u8]) -> Result<(), String> {
        let index = self.index_of(handle)?;
        if index == self.running {
            self.running_writes += 1;
            return Err("running partition".to_string());
        }
        if let Some(limit) = self.fail_write_at {
            if offset >= limit {
                return Err("flash write error".to_string());
            }
        }
        let start = offset as usize;
        self.slots[index][start..start + bytes.len()].copy_from_slice(bytes);
        self.written_bytes += bytes.len() as u32;
        Ok(())
    }

    fn set_boot_candidate(&mut self, handle: &PartitionHandle) -> Result<(), String> {
        self.boot_candidate = Some(self.index_of(handle)?);
        Ok(())
    }

    fn invalidate(&mut self, _handle: &PartitionHandle) -> Result<(), String> {
        self.invalidated += 1;
        Ok(())
    }

    fn is_pending_verify(&self) -> Result<bool, String> {
        Ok(self.pending_verify)
    }

    fn mark_valid(&mut self) -> Result<(), String> {
        self.marked_valid = true;
        self.pending_verify = false;
        Ok(())
    }

    fn mark_invalid(&mut self) -> Result<(), String> {
        self.marked_invalid = true;
        Ok(())
    }

    fn inactive_image_rejected(&mut self) -> Result<bool, String> {
        Ok(self.inactive_rejected)
    }
}

/// Body that fails with an I/O error after `fail_after` bytes
pub struct FlakyBody {
    data: Vec<u8>,
    position: usize,
    fail_after: usize,
}

impl FlakyBody {
    pub fn new(data: Vec<u8>, fail_after: usize) -> Self {
        Self {
            data,
            position: 0,
            fail_after,
        }
    }
}

impl embedded_io::ErrorType for FlakyBody {
    type Error = embedded_io::ErrorKind;
}

impl embedded_io::Read for FlakyBody {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.position >= self.fail_after {
            return Err(embedded_io::ErrorKind::ConnectionReset);
        }
        let end = (self.position + buf.len())
            .min(self.fail_after)
            .min(self.data.len());
        let n = end - self.position;
        buf[..n].copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(n)
    }
}

#[derive(Debug, Default)]
pub struct FakeRadio {
    pub statuses: Vec<StatusPacket>,
    pub addresses: Vec<Ipv4Addr>,
    pub disabled: bool,
    pub disable_requests: u32,
    pub enable_calls: u32,
    /// Radio never confirms it is off
    pub stuck: bool,
}

impl ControlRadio for FakeRadio {
    type Error = String;

    fn publish_status(&mut self, status: &StatusPacket) {
        self.statuses.push(*status);
    }

    fn publish_address(&mut self, address: Ipv4Addr) {
        self.addresses.push(address);
    }

    fn request_disable(&mut self) -> Result<(), String> {
        self.disable_requests += 1;
        if !self.stuck {
            self.disabled = true;
        }
        Ok(())
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn enable(&mut self) -> Result<(), String> {
        self.enable_calls += 1;
        self.disabled = false;
        Ok(())
    }
}

/// Transfer service over a bare link; tests drive the phase directly
#[derive(Debug, Default)]
pub struct FakeTransfer {
    pub link: Arc<TransferLink>,
    pub starts: u32,
    pub stops: u32,
    pub polls: u32,
    pub fail_start: bool,
    pub server_up: bool,
    /// Stopped while a session was still running; released by `poll`
    pub retiring: bool,
    pub releases: u32,
}

impl TransferService for FakeTransfer {
    type Error = String;

    fn start(&mut self) -> Result<(), String> {
        self.starts += 1;
        if self.fail_start {
            return Err("bind failed".to_string());
        }
        self.server_up = true;
        self.link.arm();
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.link.is_accepting()
    }

    fn phase(&self) -> TransferPhase {
        self.link.phase()
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.link.disarm();
        if std::mem::take(&mut self.server_up) {
            if self.link.session_active() {
                self.retiring = true;
            } else {
                self.releases += 1;
            }
        }
    }

    fn poll(&mut self) {
        self.polls += 1;
        if self.retiring && !self.link.session_active() {
            self.retiring = false;
            self.releases += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSystem {
    pub restarts: u32,
}

impl SystemControl for FakeSystem {
    fn restart(&mut self) {
        self.restarts += 1;
    }
}

#[derive(Debug, Default)]
pub struct FakeWatchdog {
    pub armed: Option<Duration>,
    pub disarmed: bool,
}

impl Watchdog for FakeWatchdog {
    type Error = String;

    fn arm(&mut self, deadline: Duration) -> Result<(), String> {
        self.armed = Some(deadline);
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), String> {
        self.disarmed = true;
        Ok(())
    }
}

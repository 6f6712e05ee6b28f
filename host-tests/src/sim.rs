//! Simulated console hardware
//!
//! `SimFlash` models the two OTA slots plus the bootloader's otadata rules
//! with rollback enabled:
//! - a freshly written image is `New`; the next reset boots it as
//!   `PendingVerify`
//! - a reset while the running image is still `PendingVerify` abandons it and
//!   boots the other slot
//!
//! Every reset bumps a generation counter. Handles from before the reset stop
//! working, the way code that was running at the time is simply gone.

use std::cell::Cell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use console_core::partition::{PartitionHandle, UpdatePartitions};
use console_core::platform::{ControlRadio, SystemControl};
use console_core::transfer::{TransferEndpoint, TransferPhase, TransferService};
use console_core::validator::{ProbeError, SubsystemProbe, Watchdog};
use console_core::wifi::{LinkEvent, WifiDriver};
use console_core::{Credentials, StatusPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Empty,
    New,
    PendingVerify,
    Valid,
    /// Booted and rejected; set only by a rollback
    Invalid,
}

#[derive(Debug)]
pub struct SimFlash {
    slots: [Vec<u8>; 2],
    states: [ImageState; 2],
    capacity: u32,
    running: usize,
    boot_target: usize,
    open_write: Option<usize>,
    generation: u32,
    running_writes: u32,
}

impl SimFlash {
    fn handle(&self, index: usize) -> PartitionHandle {
        let label = if index == 0 { "ota_0" } else { "ota_1" };
        PartitionHandle::new(label, 0x10000 + index as u32 * self.capacity, self.capacity)
    }

    fn index_of(&self, handle: &PartitionHandle) -> Result<usize, String> {
        (0..2)
            .find(|i| self.handle(*i) == *handle)
            .ok_or_else(|| format!("unknown partition {}", handle.label))
    }

    fn writable(&mut self, handle: &PartitionHandle) -> Result<usize, String> {
        let index = self.index_of(handle)?;
        if index == self.running {
            self.running_writes += 1;
            return Err(format!("{} is the running partition", handle.label));
        }
        Ok(index)
    }

    /// Chip reset followed by the bootloader's slot selection
    fn reset(&mut self) {
        self.generation += 1;
        self.open_write = None;
        let target = self.boot_target;
        match self.states[target] {
            ImageState::PendingVerify | ImageState::Invalid | ImageState::Empty => {
                log::info!("sim bootloader: slot {} not confirmed, rolling back", target);
                if self.states[target] == ImageState::PendingVerify {
                    self.states[target] = ImageState::Invalid;
                }
                self.boot_target = 1 - target;
                self.running = 1 - target;
            }
            ImageState::New => {
                self.states[target] = ImageState::PendingVerify;
                self.running = target;
            }
            ImageState::Valid => self.running = target,
        }
    }
}

/// Handle on the simulated flash, valid until the next chip reset
#[derive(Debug, Clone)]
pub struct SharedFlash {
    inner: Arc<Mutex<SimFlash>>,
    generation: u32,
}

impl SharedFlash {
    /// Confirmed factory image in slot 0, slot 1 erased
    pub fn with_factory_image(capacity: u32, image: &[u8]) -> Self {
        let mut slot0 = vec![0xFF; capacity as usize];
        slot0[..image.len()].copy_from_slice(image);
        let flash = SimFlash {
            slots: [slot0, vec![0xFF; capacity as usize]],
            states: [ImageState::Valid, ImageState::Empty],
            capacity,
            running: 0,
            boot_target: 0,
            open_write: None,
            generation: 0,
            running_writes: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(flash)),
            generation: 0,
        }
    }

    /// Handle for the program running after the latest reset
    pub fn boot(&self) -> SharedFlash {
        let generation = self.inspect().generation;
        Self {
            inner: self.inner.clone(),
            generation,
        }
    }

    pub fn power_cycle(&self) {
        self.inspect().reset();
    }

    /// Direct view of the chip, bypassing the generation check
    pub fn inspect(&self) -> MutexGuard<'_, SimFlash> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live(&self) -> Result<MutexGuard<'_, SimFlash>, String> {
        let guard = self.inspect();
        if guard.generation != self.generation {
            return Err("device was reset".to_string());
        }
        Ok(guard)
    }
}

impl SimFlash {
    pub fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index]
    }

    pub fn state(&self, index: usize) -> ImageState {
        self.states[index]
    }

    pub fn running_slot(&self) -> usize {
        self.running
    }

    pub fn boot_target(&self) -> usize {
        self.boot_target
    }

    pub fn running_writes(&self) -> u32 {
        self.running_writes
    }
}

impl UpdatePartitions for SharedFlash {
    type Error = String;

    fn running_partition(&self) -> Result<PartitionHandle, String> {
        let flash = self.live()?;
        Ok(flash.handle(flash.running))
    }

    fn inactive_partition(&mut self) -> Result<PartitionHandle, String> {
        let flash = self.live()?;
        Ok(flash.handle(1 - flash.running))
    }

    fn begin_write(&mut self, handle: &PartitionHandle, image_size: u32) -> Result<(), String> {
        let mut flash = self.live()?;
        let index = flash.writable(handle)?;
        if image_size > flash.capacity {
            return Err("image larger than partition".to_string());
        }
        flash.slots[index].fill(0xFF);
        flash.states[index] = ImageState::Empty;
        flash.open_write = Some(index);
        Ok(())
    }

    fn write(&mut self, handle: &PartitionHandle, offset: u32, bytes: &[u8]) -> Result<(), String> {
        let mut flash = self.live()?;
        let index = flash.writable(handle)?;
        if flash.open_write != Some(index) {
            return Err("write not begun".to_string());
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > flash.slots[index].len() {
            return Err("write past end of partition".to_string());
        }
        flash.slots[index][start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_boot_candidate(&mut self, handle: &PartitionHandle) -> Result<(), String> {
        let mut flash = self.live()?;
        let index = flash.writable(handle)?;
        if flash.open_write.take() != Some(index) {
            return Err("no finished write for this partition".to_string());
        }
        flash.states[index] = ImageState::New;
        flash.boot_target = index;
        Ok(())
    }

    fn invalidate(&mut self, handle: &PartitionHandle) -> Result<(), String> {
        let mut flash = self.live()?;
        let index = flash.writable(handle)?;
        flash.open_write = None;
        // Never reached otadata, so the bootloader has no state for it
        flash.states[index] = ImageState::Empty;
        Ok(())
    }

    fn is_pending_verify(&self) -> Result<bool, String> {
        let flash = self.live()?;
        Ok(flash.states[flash.running] == ImageState::PendingVerify)
    }

    fn mark_valid(&mut self) -> Result<(), String> {
        let mut flash = self.live()?;
        let running = flash.running;
        flash.states[running] = ImageState::Valid;
        Ok(())
    }

    fn mark_invalid(&mut self) -> Result<(), String> {
        let mut flash = self.live()?;
        let running = flash.running;
        if flash.states[1 - running] != ImageState::Valid {
            return Err("no valid image to roll back to".to_string());
        }
        flash.states[running] = ImageState::Invalid;
        flash.boot_target = 1 - running;
        flash.reset();
        Ok(())
    }

    fn inactive_image_rejected(&mut self) -> Result<bool, String> {
        let flash = self.live()?;
        Ok(flash.states[1 - flash.running] == ImageState::Invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Reachable(Ipv4Addr),
    /// Access point refuses every association
    Rejecting,
}

#[derive(Debug)]
pub struct SimWifi {
    network: Network,
    events: VecDeque<LinkEvent>,
    configured: bool,
    pub connect_requests: u32,
    pub releases: u32,
}

impl SimWifi {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            events: VecDeque::new(),
            configured: false,
            connect_requests: 0,
            releases: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }
}

impl WifiDriver for SimWifi {
    type Error = String;

    fn configure(&mut self, _credentials: &Credentials) -> Result<(), String> {
        self.configured = true;
        Ok(())
    }

    fn begin_connect(&mut self) -> Result<(), String> {
        if !self.configured {
            return Err("station not configured".to_string());
        }
        self.connect_requests += 1;
        match self.network {
            Network::Reachable(ip) => {
                self.events.push_back(LinkEvent::Associated);
                self.events.push_back(LinkEvent::GotIp(ip));
            }
            Network::Rejecting => self.events.push_back(LinkEvent::Disconnected),
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn release(&mut self) {
        self.configured = false;
        self.events.clear();
        self.releases += 1;
    }
}

/// BLE control radio; switching off takes a few polls
#[derive(Debug)]
pub struct SimRadio {
    enabled: bool,
    off_latency: u32,
    polls_until_off: Cell<u32>,
    pub status_value: [u8; 4],
    /// Status frames notified while the radio was on
    pub notifications: Vec<[u8; 4]>,
    pub address_value: Option<[u8; 4]>,
    pub enables: u32,
}

impl SimRadio {
    pub fn new(off_latency: u32) -> Self {
        Self {
            enabled: true,
            off_latency,
            polls_until_off: Cell::new(0),
            status_value: [0; 4],
            notifications: Vec::new(),
            address_value: None,
            enables: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl ControlRadio for SimRadio {
    type Error = String;

    fn publish_status(&mut self, status: &StatusPacket) {
        self.status_value = status.encode();
        if self.enabled {
            self.notifications.push(self.status_value);
        }
    }

    fn publish_address(&mut self, address: Ipv4Addr) {
        self.address_value = Some(console_core::wire::encode_address(address));
    }

    fn request_disable(&mut self) -> Result<(), String> {
        self.enabled = false;
        self.polls_until_off.set(self.off_latency);
        Ok(())
    }

    fn is_disabled(&self) -> bool {
        if self.enabled {
            return false;
        }
        let left = self.polls_until_off.get();
        if left == 0 {
            return true;
        }
        self.polls_until_off.set(left - 1);
        false
    }

    fn enable(&mut self) -> Result<(), String> {
        self.enabled = true;
        self.enables += 1;
        Ok(())
    }
}

/// Transfer server whose HTTP side is driven by the test through the endpoint
pub struct SimTransfer {
    endpoint: Arc<TransferEndpoint<SharedFlash>>,
    pub starts: u32,
    pub fail_start: bool,
}

impl SimTransfer {
    pub fn new(endpoint: Arc<TransferEndpoint<SharedFlash>>) -> Self {
        Self {
            endpoint,
            starts: 0,
            fail_start: false,
        }
    }
}

impl TransferService for SimTransfer {
    type Error = String;

    fn start(&mut self) -> Result<(), String> {
        self.starts += 1;
        if self.fail_start {
            return Err("address in use".to_string());
        }
        self.endpoint.link().arm();
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.endpoint.link().is_accepting()
    }

    fn phase(&self) -> TransferPhase {
        self.endpoint.link().phase()
    }

    fn stop(&mut self) {
        self.endpoint.link().disarm();
    }
}

pub struct SimSystem {
    flash: SharedFlash,
    pub restarts: u32,
}

impl SimSystem {
    pub fn new(flash: SharedFlash) -> Self {
        Self { flash, restarts: 0 }
    }
}

impl SystemControl for SimSystem {
    fn restart(&mut self) {
        self.restarts += 1;
        self.flash.power_cycle();
    }
}

/// Task watchdog: resets the chip unless disarmed before the deadline
pub struct SimWatchdog {
    flash: SharedFlash,
    fired: Arc<AtomicBool>,
    disarm: Option<Sender<()>>,
}

impl SimWatchdog {
    pub fn new(flash: SharedFlash) -> Self {
        Self {
            flash,
            fired: Arc::new(AtomicBool::new(false)),
            disarm: None,
        }
    }

    pub fn fired_flag(&self) -> Arc<AtomicBool> {
        self.fired.clone()
    }
}

impl Watchdog for SimWatchdog {
    type Error = String;

    fn arm(&mut self, deadline: Duration) -> Result<(), String> {
        let (tx, rx) = mpsc::channel::<()>();
        let flash = self.flash.clone();
        let fired = self.fired.clone();
        std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(deadline) {
                log::warn!("sim watchdog: deadline passed, resetting chip");
                flash.power_cycle();
                fired.store(true, Ordering::SeqCst);
            }
        });
        self.disarm = Some(tx);
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), String> {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

pub enum ProbeBehaviour {
    Pass,
    Fail(&'static str),
    /// Never returns on its own; gives up once the watchdog has fired
    Hang(Arc<AtomicBool>),
}

pub struct SimProbe {
    name: &'static str,
    behaviour: ProbeBehaviour,
    pub runs: u32,
}

impl SimProbe {
    pub fn new(name: &'static str, behaviour: ProbeBehaviour) -> Self {
        Self {
            name,
            behaviour,
            runs: 0,
        }
    }
}

impl SubsystemProbe for SimProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn probe(&mut self) -> Result<(), ProbeError> {
        self.runs += 1;
        match &self.behaviour {
            ProbeBehaviour::Pass => Ok(()),
            ProbeBehaviour::Fail(reason) => Err(ProbeError::new(*reason)),
            ProbeBehaviour::Hang(fired) => {
                let started = Instant::now();
                while !fired.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(5) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(ProbeError::new("hung"))
            }
        }
    }
}

/// HTTP request body delivered in segments of at most `segment` bytes,
/// optionally cut off after `cut_at` bytes
pub struct SegmentedBody {
    data: Vec<u8>,
    position: usize,
    segment: usize,
    cut_at: Option<usize>,
    pacing: Option<Duration>,
}

impl SegmentedBody {
    pub fn new(data: Vec<u8>, segment: usize) -> Self {
        Self {
            data,
            position: 0,
            segment,
            cut_at: None,
            pacing: None,
        }
    }

    pub fn cut_at(mut self, bytes: usize) -> Self {
        self.cut_at = Some(bytes);
        self
    }

    pub fn paced(mut self, delay: Duration) -> Self {
        self.pacing = Some(delay);
        self
    }
}

impl embedded_io::ErrorType for SegmentedBody {
    type Error = embedded_io::ErrorKind;
}

impl embedded_io::Read for SegmentedBody {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if let Some(delay) = self.pacing {
            std::thread::sleep(delay);
        }
        let limit = self.cut_at.unwrap_or(self.data.len()).min(self.data.len());
        if self.position >= limit {
            return Ok(0);
        }
        let n = buf.len().min(self.segment).min(limit - self.position);
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Deterministic firmware-like bytes
pub fn firmware_image(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 0x9E37_0000;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

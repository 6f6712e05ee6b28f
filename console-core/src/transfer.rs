//! Firmware transfer endpoint
//!
//! Accepts exactly one image per activation, streams it in `chunk_size`
//! pieces into the inactive partition while hashing, then either arms the
//! partition as the next boot target or throws the write away.
//!
//! The HTTP task runs `TransferEndpoint::receive`; the orchestrator only
//! reads the lock-free `TransferLink`.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::bridge::{OtaBridge, ProgressEvent};
use crate::digest::{Digest, ImageHasher};
use crate::error::ErrorCode;
use crate::partition::{PartitionHandle, UpdatePartitions};
use crate::wire::{UploadHeaders, WireError};

/// Milestones of the transfer server as published to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferPhase {
    Idle,
    Listening,
    Receiving,
    Verifying,
    Complete,
    Failed(ErrorCode),
}

impl TransferPhase {
    fn pack(self) -> u16 {
        let (tag, code) = match self {
            TransferPhase::Idle => (0u8, 0u8),
            TransferPhase::Listening => (1, 0),
            TransferPhase::Receiving => (2, 0),
            TransferPhase::Verifying => (3, 0),
            TransferPhase::Complete => (4, 0),
            TransferPhase::Failed(code) => (5, code.as_u8()),
        };
        u16::from(tag) | (u16::from(code) << 8)
    }

    fn unpack(raw: u16) -> Self {
        match raw & 0xFF {
            1 => TransferPhase::Listening,
            2 => TransferPhase::Receiving,
            3 => TransferPhase::Verifying,
            4 => TransferPhase::Complete,
            5 => TransferPhase::Failed(
                ErrorCode::from_u8((raw >> 8) as u8).unwrap_or(ErrorCode::TransferInterrupted),
            ),
            _ => TransferPhase::Idle,
        }
    }
}

/// Point-in-time view of the link, served as JSON on `/api/ota/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub phase: TransferPhase,
    pub accepting: bool,
    pub session_active: bool,
    pub bytes_received: u32,
    pub bytes_total: u32,
}

/// Shared state between the HTTP task and the orchestrator. Atomics only.
#[derive(Debug, Default)]
pub struct TransferLink {
    phase: AtomicU16,
    accepting: AtomicBool,
    session_active: AtomicBool,
    cancel: AtomicBool,
    bytes_received: AtomicU32,
    bytes_total: AtomicU32,
}

impl TransferLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open for exactly one upload
    pub fn arm(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_total.store(0, Ordering::Relaxed);
        self.set_phase(TransferPhase::Listening);
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Stop accepting and ask a running session to end after its current chunk
    pub fn disarm(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        if self.session_active.load(Ordering::SeqCst) {
            self.cancel.store(true, Ordering::SeqCst);
        }
        if !self.phase().is_final() {
            self.set_phase(TransferPhase::Idle);
        }
    }

    pub fn phase(&self) -> TransferPhase {
        TransferPhase::unpack(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: TransferPhase) {
        self.phase.store(phase.pack(), Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            phase: self.phase(),
            accepting: self.is_accepting(),
            session_active: self.session_active(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    fn record_progress(&self, received: u32, total: u32) {
        self.bytes_received.store(received, Ordering::Relaxed);
        self.bytes_total.store(total, Ordering::Relaxed);
    }
}

impl TransferPhase {
    /// Phases that stay put until the server is re-armed
    pub fn is_final(&self) -> bool {
        matches!(self, TransferPhase::Complete | TransferPhase::Failed(_))
    }
}

/// Orchestrator-side handle on the transfer server
pub trait TransferService {
    type Error: fmt::Debug + fmt::Display;

    /// Bring the server up and arm it for one upload
    fn start(&mut self) -> Result<(), Self::Error>;

    fn is_listening(&self) -> bool;

    fn phase(&self) -> TransferPhase;

    /// Stop accepting and cancel a running session at its next chunk
    /// boundary. Returns without waiting for that session; whatever it still
    /// holds is released from a later `poll`. Safe to call repeatedly.
    fn stop(&mut self);

    /// Called once per orchestrator tick. Never blocks.
    fn poll(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Busy,
    NotListening,
    InvalidSize(u32),
    MissingHeader(&'static str),
    InvalidHeader(String),
    Interrupted(String),
    Cancelled,
    WriteFailed(String),
    DigestMismatch,
    Partition(String),
}

impl TransferError {
    /// Code the attempt fails with. `None` when the request is refused
    /// without touching the running session.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Busy | TransferError::NotListening => None,
            TransferError::InvalidSize(_)
            | TransferError::MissingHeader(_)
            | TransferError::InvalidHeader(_) => Some(ErrorCode::TransferRejected),
            TransferError::Interrupted(_) => Some(ErrorCode::TransferInterrupted),
            TransferError::Cancelled => Some(ErrorCode::Aborted),
            TransferError::WriteFailed(_) | TransferError::Partition(_) => {
                Some(ErrorCode::PartitionWriteFailed)
            }
            TransferError::DigestMismatch => Some(ErrorCode::IntegrityCheckFailed),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Busy => 409,
            TransferError::NotListening => 503,
            TransferError::InvalidSize(_) => 413,
            TransferError::MissingHeader(_) | TransferError::InvalidHeader(_) => 400,
            TransferError::Interrupted(_) => 400,
            TransferError::Cancelled => 503,
            TransferError::WriteFailed(_) | TransferError::Partition(_) => 500,
            TransferError::DigestMismatch => 422,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Busy => write!(f, "another upload is in progress"),
            TransferError::NotListening => write!(f, "not accepting uploads"),
            TransferError::InvalidSize(size) => {
                write!(f, "image size {} does not fit the update partition", size)
            }
            TransferError::MissingHeader(name) => write!(f, "missing header {}", name),
            TransferError::InvalidHeader(msg) => write!(f, "{}", msg),
            TransferError::Interrupted(msg) => write!(f, "transfer interrupted: {}", msg),
            TransferError::Cancelled => write!(f, "transfer cancelled"),
            TransferError::WriteFailed(msg) => write!(f, "partition write failed: {}", msg),
            TransferError::DigestMismatch => write!(f, "SHA-256 mismatch"),
            TransferError::Partition(msg) => write!(f, "partition error: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<WireError> for TransferError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::MissingHeader(name) => TransferError::MissingHeader(name),
            other => TransferError::InvalidHeader(other.to_string()),
        }
    }
}

/// Result of an accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub partition: PartitionHandle,
    pub bytes: u32,
    pub digest: Digest,
}

struct TransferSession {
    hasher: ImageHasher,
    target: PartitionHandle,
    expected_size: u32,
    expected_digest: Digest,
    bytes_written: u32,
}

/// Releases the single-session slot however the upload ends
pub(crate) struct SessionSlot<'a>(&'a TransferLink);

impl<'a> SessionSlot<'a> {
    pub(crate) fn claim(link: &'a TransferLink) -> Option<Self> {
        link.session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionSlot(link))
    }
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.0.session_active.store(false, Ordering::Release);
    }
}

pub struct TransferEndpoint<P: UpdatePartitions> {
    link: Arc<TransferLink>,
    partitions: Mutex<P>,
    bridge: Arc<OtaBridge>,
    chunk_size: usize,
}

impl<P: UpdatePartitions> TransferEndpoint<P> {
    pub fn new(
        link: Arc<TransferLink>,
        partitions: P,
        bridge: Arc<OtaBridge>,
        chunk_size: usize,
    ) -> Self {
        Self {
            link,
            partitions: Mutex::new(partitions),
            bridge,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn link(&self) -> &Arc<TransferLink> {
        &self.link
    }

    /// Run the partitions through `f`, e.g. to inspect them after a test upload
    pub fn with_partitions<T>(&self, f: impl FnOnce(&mut P) -> T) -> Option<T> {
        self.partitions.lock().ok().map(|mut p| f(&mut p))
    }

    /// Handle one `POST /ota/update`. `size_header` and `digest_header` are
    /// the raw header values.
    pub fn receive<R: embedded_io::Read>(
        &self,
        size_header: Option<&str>,
        digest_header: Option<&str>,
        body: &mut R,
    ) -> Result<TransferReceipt, TransferError> {
        // Claimed before anything can touch the phase of a live session
        let Some(_slot) = SessionSlot::claim(&self.link) else {
            log::warn!("OTA: upload refused, session already active");
            return Err(TransferError::Busy);
        };
        if !self.link.is_accepting() {
            log::warn!("OTA: upload refused, server not accepting");
            return Err(TransferError::NotListening);
        }

        let headers = match UploadHeaders::parse(size_header, digest_header) {
            Ok(headers) => headers,
            Err(e) => return Err(self.reject(e.into())),
        };

        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| TransferError::Partition("partition lock poisoned".to_string()))?;

        let target = match Self::select_target(&mut *partitions) {
            Ok(target) => target,
            Err(e) => return Err(self.fail_early(e)),
        };
        if !target.fits(headers.size) {
            log::warn!(
                "OTA: image of {} bytes does not fit {} ({} bytes)",
                headers.size,
                target.label,
                target.capacity
            );
            return Err(self.reject(TransferError::InvalidSize(headers.size)));
        }

        if let Err(e) = partitions.begin_write(&target, headers.size) {
            return Err(self.fail_early(TransferError::WriteFailed(e.to_string())));
        }

        log::info!(
            "OTA: receiving {} bytes into {}",
            headers.size,
            target
        );
        self.link.record_progress(0, headers.size);

        let mut session = TransferSession {
            hasher: ImageHasher::new(),
            target,
            expected_size: headers.size,
            expected_digest: headers.digest,
            bytes_written: 0,
        };

        match self.stream(&mut *partitions, &mut session, body) {
            Ok(()) => self.finish(&mut *partitions, session),
            Err(e) => Err(self.abandon(&mut *partitions, &session.target, e)),
        }
    }

    fn select_target(partitions: &mut P) -> Result<PartitionHandle, TransferError> {
        let running = partitions
            .running_partition()
            .map_err(|e| TransferError::Partition(e.to_string()))?;
        let target = partitions
            .inactive_partition()
            .map_err(|e| TransferError::Partition(e.to_string()))?;
        if target == running {
            return Err(TransferError::Partition(format!(
                "inactive slot {} is the running slot",
                target.label
            )));
        }
        Ok(target)
    }

    fn stream<R: embedded_io::Read>(
        &self,
        partitions: &mut P,
        session: &mut TransferSession,
        body: &mut R,
    ) -> Result<(), TransferError> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut last_logged = 0u8;

        while session.bytes_written < session.expected_size {
            if self.link.cancel_requested() {
                return Err(TransferError::Cancelled);
            }

            let remaining = (session.expected_size - session.bytes_written) as usize;
            let want = remaining.min(buffer.len());
            let read = match body.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(TransferError::Interrupted(format!(
                        "body ended after {} of {} bytes",
                        session.bytes_written, session.expected_size
                    )))
                }
                Ok(n) => n,
                Err(e) => return Err(TransferError::Interrupted(format!("{:?}", e))),
            };

            if session.bytes_written == 0 {
                self.link.set_phase(TransferPhase::Receiving);
            }

            let chunk = &buffer[..read];
            session.hasher.update(chunk);
            partitions
                .write(&session.target, session.bytes_written, chunk)
                .map_err(|e| TransferError::WriteFailed(e.to_string()))?;
            session.bytes_written += read as u32;

            let progress = ProgressEvent::new(session.bytes_written, session.expected_size);
            self.link
                .record_progress(session.bytes_written, session.expected_size);
            self.bridge.post_progress(progress);

            log::trace!("OTA: chunk of {} bytes at offset {}", read, session.bytes_written);
            if progress.percent >= last_logged.saturating_add(10) {
                last_logged = progress.percent - progress.percent % 10;
                log::debug!(
                    "OTA progress: {}% ({}/{})",
                    progress.percent,
                    session.bytes_written,
                    session.expected_size
                );
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        partitions: &mut P,
        session: TransferSession,
    ) -> Result<TransferReceipt, TransferError> {
        self.link.set_phase(TransferPhase::Verifying);
        let TransferSession {
            hasher,
            target,
            expected_digest,
            bytes_written,
            ..
        } = session;
        let digest = hasher.finalize();

        if digest != expected_digest {
            log::error!(
                "OTA: SHA-256 mismatch, expected {} got {}",
                crate::digest::to_hex(&expected_digest),
                crate::digest::to_hex(&digest)
            );
            return Err(self.abandon(partitions, &target, TransferError::DigestMismatch));
        }

        if let Err(e) = partitions.set_boot_candidate(&target) {
            return Err(self.abandon(
                partitions,
                &target,
                TransferError::WriteFailed(e.to_string()),
            ));
        }

        log::info!("OTA: image verified, {} armed for next boot", target.label);
        self.link.set_phase(TransferPhase::Complete);
        self.link.accepting.store(false, Ordering::SeqCst);
        Ok(TransferReceipt {
            partition: target,
            bytes: bytes_written,
            digest,
        })
    }

    /// Request refused before any flash was touched
    fn reject(&self, error: TransferError) -> TransferError {
        log::warn!("OTA: upload rejected: {}", error);
        self.fail_early(error)
    }

    fn fail_early(&self, error: TransferError) -> TransferError {
        if let Some(code) = error.code() {
            self.link.set_phase(TransferPhase::Failed(code));
        }
        self.link.accepting.store(false, Ordering::SeqCst);
        error
    }

    /// Throw away a started write; the previous firmware stays the boot target
    fn abandon(
        &self,
        partitions: &mut P,
        target: &PartitionHandle,
        error: TransferError,
    ) -> TransferError {
        log::error!("OTA: transfer failed: {}", error);
        if let Err(e) = partitions.invalidate(target) {
            log::warn!("OTA: could not invalidate {}: {}", target.label, e);
        }
        self.fail_early(error)
    }
}

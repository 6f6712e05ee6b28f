//! Post-update validator
//!
//! Runs once, early in the first boot of a freshly flashed image. A fixed
//! battery of subsystem probes must pass under a hardware watchdog deadline
//! before the image is committed. Anything else rolls back: a failed probe
//! calls `mark_invalid` directly, while a hang or crash resets the chip with
//! the image still pending-verify and the bootloader reverts on its own.

use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::partition::UpdatePartitions;

/// Reported as the failing subsystem when the probes overran the budget
pub const DEADLINE_SUBSYSTEM: &str = "deadline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ProbeError {}

/// One subsystem check (display, persistence, wireless stack, audio)
pub trait SubsystemProbe {
    fn name(&self) -> &'static str;

    /// Exercise the subsystem once. Must return within the self-test budget.
    fn probe(&mut self) -> Result<(), ProbeError>;
}

/// Hardware watchdog that resets the chip when the deadline passes
pub trait Watchdog {
    type Error: fmt::Debug + fmt::Display;

    fn arm(&mut self, deadline: Duration) -> Result<(), Self::Error>;

    fn disarm(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestOutcome {
    /// Running image was already confirmed; nothing to do
    NotPending,
    Committed,
    /// Only observable off-target; on the device `mark_invalid` restarts
    RolledBack { subsystem: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    Partition(String),
}

impl fmt::Display for ValidatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorError::Partition(msg) => write!(f, "partition state error: {}", msg),
        }
    }
}

impl std::error::Error for ValidatorError {}

pub struct PostUpdateValidator<P: UpdatePartitions, D: Watchdog> {
    partitions: P,
    watchdog: D,
    budget: Duration,
}

impl<P: UpdatePartitions, D: Watchdog> PostUpdateValidator<P, D> {
    pub fn new(partitions: P, watchdog: D, budget: Duration) -> Self {
        Self {
            partitions,
            watchdog,
            budget,
        }
    }

    pub fn partitions(&self) -> &P {
        &self.partitions
    }

    pub fn watchdog(&self) -> &D {
        &self.watchdog
    }

    pub fn into_partitions(self) -> P {
        self.partitions
    }

    pub fn run_self_test(
        &mut self,
        probes: &mut [&mut dyn SubsystemProbe],
    ) -> Result<SelfTestOutcome, ValidatorError> {
        let pending = self
            .partitions
            .is_pending_verify()
            .map_err(|e| ValidatorError::Partition(e.to_string()))?;
        if !pending {
            log::debug!("Self-test: running image already confirmed");
            return Ok(SelfTestOutcome::NotPending);
        }

        log::info!(
            "Self-test: new firmware pending verification, {} probes, budget {:?}",
            probes.len(),
            self.budget
        );
        if let Err(e) = self.watchdog.arm(self.budget) {
            log::warn!("Self-test: watchdog not armed ({}), relying on elapsed-time check", e);
        }

        let started = Instant::now();
        for probe in probes.iter_mut() {
            let name = probe.name();
            let result = panic::catch_unwind(AssertUnwindSafe(|| probe.probe()));
            match result {
                Ok(Ok(())) => log::info!("Self-test: {} ok", name),
                Ok(Err(e)) => {
                    log::error!("Self-test: {} failed: {}", name, e);
                    return self.roll_back(name);
                }
                Err(_) => {
                    log::error!("Self-test: {} panicked", name);
                    return self.roll_back(name);
                }
            }
            if started.elapsed() > self.budget {
                log::error!("Self-test: budget of {:?} exceeded after {}", self.budget, name);
                return self.roll_back(DEADLINE_SUBSYSTEM);
            }
        }

        self.partitions
            .mark_valid()
            .map_err(|e| ValidatorError::Partition(e.to_string()))?;
        self.disarm();
        log::info!("Self-test: passed in {:?}, firmware committed", started.elapsed());
        Ok(SelfTestOutcome::Committed)
    }

    /// Whether a rolled-back update still has to be shown to the user.
    ///
    /// `reported` is the flag persisted across boots and is updated in place.
    /// It follows the other slot: set while that slot holds a rejected image,
    /// cleared once it does not, so every rollback is reported exactly once.
    /// Call before `run_self_test` so a hang in the probes cannot skip the
    /// clearing on the first boot of a new image.
    pub fn take_rollback_notice(&mut self, reported: &mut bool) -> Result<bool, ValidatorError> {
        let rejected = self
            .partitions
            .inactive_image_rejected()
            .map_err(|e| ValidatorError::Partition(e.to_string()))?;
        let notice = rejected && !*reported;
        *reported = rejected;
        if notice {
            log::warn!("Self-test: previous update failed verification and was rolled back");
        }
        Ok(notice)
    }

    fn roll_back(&mut self, subsystem: &'static str) -> Result<SelfTestOutcome, ValidatorError> {
        self.disarm();
        log::warn!("Self-test: rolling back to previous firmware");
        self.partitions
            .mark_invalid()
            .map_err(|e| ValidatorError::Partition(e.to_string()))?;
        Ok(SelfTestOutcome::RolledBack { subsystem })
    }

    fn disarm(&mut self) {
        if let Err(e) = self.watchdog.disarm() {
            log::warn!("Self-test: could not disarm watchdog: {}", e);
        }
    }
}

// Boot/partition boundary - the two app slots as seen by the update pipeline

use core::fmt;

/// Identifies one app slot in flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    pub label: heapless::String<16>,
    /// Flash offset of the slot
    pub address: u32,
    /// Slot size in bytes; the largest image it can hold
    pub capacity: u32,
}

impl PartitionHandle {
    pub fn new(label: &str, address: u32, capacity: u32) -> Self {
        let mut name = heapless::String::new();
        for c in label.chars() {
            if name.push(c).is_err() {
                break;
            }
        }
        Self {
            label: name,
            address,
            capacity,
        }
    }

    pub fn fits(&self, image_size: u32) -> bool {
        image_size > 0 && image_size <= self.capacity
    }
}

impl fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ 0x{:06x} ({} KB)",
            self.label,
            self.address,
            self.capacity / 1024
        )
    }
}

/// Platform access to the OTA slots and the bootloader's verify state.
///
/// The update pipeline only ever writes the handle returned by
/// `inactive_partition`; implementations still refuse a write aimed at the
/// running slot.
pub trait UpdatePartitions {
    type Error: fmt::Debug + fmt::Display;

    fn running_partition(&self) -> Result<PartitionHandle, Self::Error>;

    /// The slot the next image goes to. Never the running one.
    fn inactive_partition(&mut self) -> Result<PartitionHandle, Self::Error>;

    /// Erase and open `handle` for an image of `image_size` bytes
    fn begin_write(&mut self, handle: &PartitionHandle, image_size: u32) -> Result<(), Self::Error>;

    fn write(&mut self, handle: &PartitionHandle, offset: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Close the write and make `handle` the next boot target in the
    /// pending-verify state
    fn set_boot_candidate(&mut self, handle: &PartitionHandle) -> Result<(), Self::Error>;

    /// Abandon an open or finished write; the boot target is unchanged
    fn invalidate(&mut self, handle: &PartitionHandle) -> Result<(), Self::Error>;

    /// Running image booted for the first time after an update and has not
    /// been confirmed yet
    fn is_pending_verify(&self) -> Result<bool, Self::Error>;

    fn mark_valid(&mut self) -> Result<(), Self::Error>;

    /// The other slot holds an image that was booted and then rejected, by
    /// a failed self-test or by the bootloader after a reset while it was
    /// still pending verification. An image discarded during transfer does
    /// not count.
    fn inactive_image_rejected(&mut self) -> Result<bool, Self::Error>;

    /// Mark the running image bad and restart into the previous one. Only
    /// returns if the rollback could not be started.
    fn mark_invalid(&mut self) -> Result<(), Self::Error>;
}

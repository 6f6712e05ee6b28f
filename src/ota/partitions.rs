// OTA slots through the ESP-IDF app-update API

use core::ffi::{c_void, CStr};
use core::fmt;

use console_core::{PartitionHandle, UpdatePartitions};
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_get_state_partition, esp_ota_handle_t,
    esp_ota_img_states_t, esp_ota_img_states_t_ESP_OTA_IMG_ABORTED,
    esp_ota_img_states_t_ESP_OTA_IMG_INVALID, esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY,
    esp_ota_mark_app_invalid_rollback_and_reboot, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write_with_offset, esp_partition_t, EspError, ESP_OK,
};

#[derive(Debug)]
pub enum PartitionError {
    NoUpdatePartition,
    RunningSlot,
    UnknownSlot(u32),
    NoOpenWrite,
    Esp(EspError),
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::NoUpdatePartition => write!(f, "no OTA update partition"),
            PartitionError::RunningSlot => write!(f, "refusing to write the running partition"),
            PartitionError::UnknownSlot(address) => {
                write!(f, "no OTA partition at 0x{:06x}", address)
            }
            PartitionError::NoOpenWrite => write!(f, "no image write in progress"),
            PartitionError::Esp(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PartitionError {}

impl From<EspError> for PartitionError {
    fn from(e: EspError) -> Self {
        PartitionError::Esp(e)
    }
}

pub struct EspPartitions {
    running: *const esp_partition_t,
    inactive: *const esp_partition_t,
    ota_handle: Option<esp_ota_handle_t>,
}

// Partition table entries are static for the lifetime of the program
unsafe impl Send for EspPartitions {}

impl EspPartitions {
    pub fn new() -> Result<Self, PartitionError> {
        let running = unsafe { esp_ota_get_running_partition() };
        if running.is_null() {
            return Err(PartitionError::NoUpdatePartition);
        }
        Ok(Self {
            running,
            inactive: core::ptr::null(),
            ota_handle: None,
        })
    }

    fn resolve(&self, handle: &PartitionHandle) -> Result<*const esp_partition_t, PartitionError> {
        if handle.address == unsafe { (*self.running).address } {
            return Err(PartitionError::RunningSlot);
        }
        if self.inactive.is_null() || unsafe { (*self.inactive).address } != handle.address {
            return Err(PartitionError::UnknownSlot(handle.address));
        }
        Ok(self.inactive)
    }

    fn abort_open_write(&mut self) {
        if let Some(h) = self.ota_handle.take() {
            if let Err(e) = esp!(unsafe { esp_ota_abort(h) }) {
                log::warn!("OTA: abort of open write failed: {}", e);
            }
        }
    }
}

fn to_handle(partition: *const esp_partition_t) -> PartitionHandle {
    let p = unsafe { &*partition };
    let label = unsafe { CStr::from_ptr(p.label.as_ptr()) }
        .to_str()
        .unwrap_or("ota");
    PartitionHandle::new(label, p.address, p.size)
}

impl UpdatePartitions for EspPartitions {
    type Error = PartitionError;

    fn running_partition(&self) -> Result<PartitionHandle, Self::Error> {
        Ok(to_handle(self.running))
    }

    fn inactive_partition(&mut self) -> Result<PartitionHandle, Self::Error> {
        let next = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if next.is_null() {
            return Err(PartitionError::NoUpdatePartition);
        }
        if unsafe { (*next).address == (*self.running).address } {
            return Err(PartitionError::RunningSlot);
        }
        self.inactive = next;
        Ok(to_handle(next))
    }

    fn begin_write(&mut self, handle: &PartitionHandle, image_size: u32) -> Result<(), Self::Error> {
        let partition = self.resolve(handle)?;
        self.abort_open_write();

        let mut ota_handle: esp_ota_handle_t = 0;
        // Erases only the sectors the image needs
        esp!(unsafe { esp_ota_begin(partition, image_size as usize, &mut ota_handle) })?;
        self.ota_handle = Some(ota_handle);
        log::debug!("OTA: opened {} for {} bytes", handle, image_size);
        Ok(())
    }

    fn write(&mut self, handle: &PartitionHandle, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.resolve(handle)?;
        let ota_handle = self.ota_handle.ok_or(PartitionError::NoOpenWrite)?;
        esp!(unsafe {
            esp_ota_write_with_offset(
                ota_handle,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                offset,
            )
        })?;
        Ok(())
    }

    fn set_boot_candidate(&mut self, handle: &PartitionHandle) -> Result<(), Self::Error> {
        let partition = self.resolve(handle)?;
        let ota_handle = self.ota_handle.take().ok_or(PartitionError::NoOpenWrite)?;
        // Checks the app image header and, with secure boot, the signature
        esp!(unsafe { esp_ota_end(ota_handle) })?;
        esp!(unsafe { esp_ota_set_boot_partition(partition) })?;
        log::info!("OTA: boot target is now {} (pending verify)", handle);
        Ok(())
    }

    fn invalidate(&mut self, handle: &PartitionHandle) -> Result<(), Self::Error> {
        self.resolve(handle)?;
        self.abort_open_write();
        log::warn!("OTA: image in {} discarded, boot target unchanged", handle);
        Ok(())
    }

    fn is_pending_verify(&self) -> Result<bool, Self::Error> {
        let mut state: esp_ota_img_states_t = 0;
        let result = unsafe { esp_ota_get_state_partition(self.running, &mut state) };
        if result != ESP_OK {
            // Factory image or no otadata entry: nothing to verify
            log::debug!("OTA: no image state for running partition ({})", result);
            return Ok(false);
        }
        Ok(state == esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY)
    }

    fn mark_valid(&mut self) -> Result<(), Self::Error> {
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() })?;
        Ok(())
    }

    fn inactive_image_rejected(&mut self) -> Result<bool, Self::Error> {
        let next = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if next.is_null() {
            return Err(PartitionError::NoUpdatePartition);
        }
        let mut state: esp_ota_img_states_t = 0;
        if unsafe { esp_ota_get_state_partition(next, &mut state) } != ESP_OK {
            // Never armed through otadata
            return Ok(false);
        }
        Ok(matches!(
            state,
            esp_ota_img_states_t_ESP_OTA_IMG_INVALID | esp_ota_img_states_t_ESP_OTA_IMG_ABORTED
        ))
    }

    fn mark_invalid(&mut self) -> Result<(), Self::Error> {
        // Restarts into the previous image on success
        esp!(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })?;
        Ok(())
    }
}

impl Drop for EspPartitions {
    fn drop(&mut self) {
        self.abort_open_write();
    }
}

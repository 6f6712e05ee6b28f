pub mod button;
pub mod reset;

pub use button::AbortButton;

use console_core::SystemControl;

/// Software restart through ESP-IDF
pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        log::info!("Restarting system...");
        log::logger().flush();
        unsafe { esp_idf_sys::esp_restart() };
    }
}

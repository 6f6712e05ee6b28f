use anyhow::Result;
use console_core::{ControlRequest, OtaBridge, ProvisioningEvent};
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use std::time::{Duration, Instant};

const DEBOUNCE_TIME: Duration = Duration::from_millis(50);
const LONG_PRESS_TIME: Duration = Duration::from_millis(1000);

/// Front-panel button: a long press aborts a running update
pub struct AbortButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
    press_time: Option<Instant>,
    last_change: Instant,
    fired: bool,
}

impl AbortButton {
    pub fn new(pin: impl Into<AnyIOPin> + 'static) -> Result<Self> {
        let mut pin = PinDriver::input(pin.into())?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            pin,
            press_time: None,
            last_change: Instant::now(),
            fired: false,
        })
    }

    /// Sample the button; posts `Abort` to the bridge once per long press
    pub fn poll(&mut self, bridge: &OtaBridge) {
        let now = Instant::now();
        let pressed = self.pin.is_low(); // Active low

        if pressed != self.press_time.is_some() {
            if now.duration_since(self.last_change) < DEBOUNCE_TIME {
                return;
            }
            self.last_change = now;
            self.press_time = pressed.then_some(now);
            self.fired = false;
            return;
        }

        if let Some(since) = self.press_time {
            if !self.fired && now.duration_since(since) >= LONG_PRESS_TIME {
                self.fired = true;
                log::info!("Abort requested from front panel");
                bridge.post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
            }
        }
    }
}

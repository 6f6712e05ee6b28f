use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver};
use esp_idf_hal::prelude::*;
use esp_idf_svc::{
    bt::{Ble, BtDriver},
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
};
use esp_idf_sys as _; // Binstart
use std::sync::Arc;
use std::time::Instant;

use console_core::{
    ErrorCode, OtaBridge, OtaState, PostUpdateValidator, SelfTestOutcome, SystemControl, TransferEndpoint,
    TransferLink, UpdateOrchestrator, UpdatePartitions,
};
use log::info;

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod ota;
mod provisioning;
mod system;
mod version;

use crate::network::EspWifiDriver;
use crate::ota::self_test::{AudioProbe, BluetoothProbe, DisplayProbe, StorageProbe, TaskWatchdog};
use crate::ota::{EspPartitions, HttpTransferService};
use crate::provisioning::BleControlRadio;
use crate::system::{AbortButton, EspSystem};

fn main() -> Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();

    logging::init_logger()?;
    info!("Driver console {}", version::full_version());
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let boot_cause = system::reset::BootCause::read();
    info!("Boot reason: {}", boot_cause);
    if boot_cause.is_abnormal() {
        log::warn!("Previous boot ended abnormally, any unconfirmed update was reverted");
    }

    // Take peripherals and system event loop
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mut store = config::ConfigStore::open(nvs.clone())?;
    let ota_config = store.load_or_default();
    if let Some(level) = store.log_level() {
        if !logging::set_max_level_from_str(&level) {
            log::warn!("Ignoring stored log level '{}'", level);
        }
    }

    let (wifi_modem, bt_modem) = peripherals.modem.split();
    let bridge = Arc::new(OtaBridge::new());

    // Provisioning radio comes up first; the self-test checks it
    let bt = BtDriver::<Ble>::new(bt_modem, Some(nvs.clone()))?;
    let radio = BleControlRadio::start(bt, bridge.clone())?;

    let mut rollback_notice = false;
    let partitions = {
        let mut display = DisplayProbe::new(peripherals.pins.gpio15, peripherals.pins.gpio38)?;
        let mut storage = StorageProbe::new(nvs.clone())?;
        let mut bluetooth = BluetoothProbe;
        let buzzer_timer = LedcTimerDriver::new(
            peripherals.ledc.timer0,
            &TimerConfig::default().frequency(2.kHz().into()),
        )?;
        let mut audio = AudioProbe::new(LedcDriver::new(
            peripherals.ledc.channel0,
            buzzer_timer,
            peripherals.pins.gpio21,
        )?);

        let mut validator = PostUpdateValidator::new(
            EspPartitions::new()?,
            TaskWatchdog::new(),
            ota_config.self_test_budget(),
        );
        // Before the self-test: a hang there must not keep a stale flag alive
        let mut reported = store.rollback_reported();
        let was_reported = reported;
        match validator.take_rollback_notice(&mut reported) {
            Ok(notice) => rollback_notice = notice,
            Err(e) => log::warn!("Could not check for a rolled-back update: {}", e),
        }
        if reported != was_reported {
            if let Err(e) = store.set_rollback_reported(reported) {
                log::warn!("Could not persist rollback notice: {:?}", e);
            }
        }
        match validator.run_self_test(&mut [&mut display, &mut storage, &mut bluetooth, &mut audio]) {
            Ok(SelfTestOutcome::Committed) => info!("New firmware confirmed"),
            Ok(SelfTestOutcome::NotPending) => {}
            Ok(SelfTestOutcome::RolledBack { subsystem }) => {
                // mark_invalid normally restarts; force it if it did not
                log::error!("Self-test failed in {}, rollback did not restart", subsystem);
                EspSystem.restart();
            }
            Err(e) => log::error!("Self-test could not complete: {}", e),
        }
        validator.into_partitions()
    };
    match partitions.running_partition() {
        Ok(running) => info!("Running from {}", running),
        Err(e) => log::warn!("Running partition unknown: {}", e),
    }

    let wifi = EspWifiDriver::new(wifi_modem, sys_loop.clone())?;
    let endpoint = Arc::new(TransferEndpoint::new(
        Arc::new(TransferLink::new()),
        partitions,
        bridge.clone(),
        ota_config.chunk_size,
    ));
    let transfer = HttpTransferService::new(endpoint);
    let mut abort_button = AbortButton::new(peripherals.pins.gpio14)?;

    let tick_ms = ota_config.tick_interval_ms;
    let mut orchestrator = UpdateOrchestrator::new(
        ota_config,
        bridge.clone(),
        wifi,
        radio,
        transfer,
        EspSystem,
        Instant::now(),
    );
    if rollback_notice {
        orchestrator.report_failure(ErrorCode::SelfTestFailed, Instant::now());
    }

    info!("Waiting for Wi-Fi credentials over BLE");
    let mut last_state = OtaState::Idle;
    loop {
        abort_button.poll(&bridge);
        orchestrator.tick(Instant::now());

        let state = orchestrator.current_state();
        if state != last_state {
            if let Some(progress) = orchestrator.current_progress() {
                log::debug!("OTA progress {}%", progress.percent);
            }
            // Reading the message marks the failure as shown to the user
            if state.is_failed() {
                if let Some(message) = orchestrator.error_message() {
                    log::error!("Update failed: {}", message);
                }
            }
            last_state = state;
        }

        FreeRtos::delay_ms(tick_ms);
    }
}

//! End-to-end update attempts against the simulated console

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use console_core::bridge::{ControlRequest, ProvisioningEvent};
use console_core::digest::{sha256, to_hex};
use console_core::transfer::{TransferError, TransferReceipt};
use console_core::validator::ValidatorError;
use console_core::wire::{encode_credentials, StatusPacket};
use console_core::{
    Credentials, ErrorCode, OtaBridge, OtaConfig, OtaState, PostUpdateValidator, SelfTestOutcome,
    SubsystemProbe, TransferEndpoint, TransferLink, UpdateOrchestrator,
};

use crate::sim::*;

const CAPACITY: u32 = 3 * 1024 * 1024;
const IMAGE_SIZE: usize = 2 * 1024 * 1024;
const CONSOLE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

type Orchestrator = UpdateOrchestrator<SimWifi, SimRadio, SimTransfer, SimSystem>;

struct Console {
    bridge: Arc<OtaBridge>,
    endpoint: Arc<TransferEndpoint<SharedFlash>>,
    orch: Orchestrator,
    visited: Vec<OtaState>,
}

impl Console {
    fn boot(flash: &SharedFlash, network: Network) -> Self {
        let flash = flash.boot();
        let config = OtaConfig {
            reboot_delay_ms: 100,
            ..OtaConfig::default()
        };
        let bridge = Arc::new(OtaBridge::new());
        let endpoint = Arc::new(TransferEndpoint::new(
            Arc::new(TransferLink::new()),
            flash.clone(),
            bridge.clone(),
            config.chunk_size,
        ));
        let orch = UpdateOrchestrator::new(
            config,
            bridge.clone(),
            SimWifi::new(network),
            SimRadio::new(2),
            SimTransfer::new(endpoint.clone()),
            SimSystem::new(flash),
            Instant::now(),
        );
        Self {
            bridge,
            endpoint,
            orch,
            visited: vec![OtaState::Idle],
        }
    }

    fn provision(&self) {
        let credentials = Credentials::new(b"HomeNet", b"secret123").unwrap();
        let frame = encode_credentials(&credentials);
        assert_eq!(self.bridge.post_credential_frame(&frame), Ok(true));
    }

    fn tick(&mut self) -> OtaState {
        self.orch.tick(Instant::now());
        let state = self.orch.current_state();
        if self.visited.last() != Some(&state) {
            self.visited.push(state);
        }
        state
    }

    /// Tick on the real clock until `done` holds or `limit` passes
    fn run_until(&mut self, limit: Duration, done: impl Fn(&Orchestrator) -> bool) {
        let started = Instant::now();
        while !done(&self.orch) {
            assert!(
                started.elapsed() < limit,
                "stuck in {} after {:?}",
                self.orch.current_state(),
                limit
            );
            self.tick();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn run_until_state(&mut self, target: OtaState) {
        self.run_until(Duration::from_secs(20), |orch| orch.current_state() == target);
    }

    fn upload(
        &self,
        body: SegmentedBody,
        size: usize,
        digest_hex: String,
    ) -> JoinHandle<Result<TransferReceipt, TransferError>> {
        let endpoint = self.endpoint.clone();
        std::thread::spawn(move || {
            let mut body = body;
            let size = size.to_string();
            endpoint.receive(Some(size.as_str()), Some(digest_hex.as_str()), &mut body)
        })
    }
}

fn factory_flash() -> (SharedFlash, Vec<u8>) {
    let factory = firmware_image(512 * 1024, 1);
    (SharedFlash::with_factory_image(CAPACITY, &factory), factory)
}

fn all_pass() -> [SimProbe; 4] {
    [
        SimProbe::new("display", ProbeBehaviour::Pass),
        SimProbe::new("storage", ProbeBehaviour::Pass),
        SimProbe::new("bluetooth", ProbeBehaviour::Pass),
        SimProbe::new("audio", ProbeBehaviour::Pass),
    ]
}

/// Provision, upload a good image and let the console restart into it
fn install_update(flash: &SharedFlash) -> Vec<u8> {
    let mut console = Console::boot(flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(IMAGE_SIZE, 7);
    let upload = console.upload(
        SegmentedBody::new(image.clone(), 4096),
        image.len(),
        to_hex(&sha256(&image)),
    );
    console.run_until(Duration::from_secs(30), |orch| orch.system().restarts == 1);
    upload.join().unwrap().unwrap();
    image
}

#[test]
fn happy_path_installs_and_commits_2mb_image() {
    let (flash, factory) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));

    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);
    assert_eq!(console.orch.radio().address_value, Some([192, 168, 1, 50]));
    assert!(!console.orch.radio().is_enabled());

    let image = firmware_image(IMAGE_SIZE, 7);
    let upload = console.upload(
        SegmentedBody::new(image.clone(), 4096),
        image.len(),
        to_hex(&sha256(&image)).to_uppercase(),
    );
    console.run_until(Duration::from_secs(30), |orch| orch.system().restarts == 1);

    let receipt = upload.join().unwrap().unwrap();
    assert_eq!(receipt.bytes as usize, IMAGE_SIZE);
    assert_eq!(receipt.partition.label.as_str(), "ota_1");

    assert_eq!(
        console.visited,
        vec![
            OtaState::Idle,
            OtaState::ConnectingWifi,
            OtaState::WifiConnected,
            OtaState::DisablingRadio,
            OtaState::StartingTransferServer,
            OtaState::WaitingForFirmware,
            OtaState::Receiving,
            OtaState::Verifying,
            OtaState::Rebooting,
        ]
    );
    let tags: Vec<u8> = console.orch.radio().notifications.iter().map(|f| f[1]).collect();
    assert_eq!(tags, vec![1, 2]);
    assert_eq!(
        StatusPacket::decode(&console.orch.radio().status_value),
        Ok(StatusPacket::new(OtaState::Rebooting, 100))
    );
    assert!(console.orch.wifi_driver().releases >= 1);

    {
        let chip = flash.inspect();
        assert_eq!(chip.running_slot(), 1);
        assert_eq!(chip.state(1), ImageState::PendingVerify);
        assert_eq!(&chip.slot(1)[..IMAGE_SIZE], image.as_slice());
        assert_eq!(&chip.slot(0)[..factory.len()], factory.as_slice());
        assert_eq!(chip.running_writes(), 0);
    }

    let booted = flash.boot();
    let mut validator = PostUpdateValidator::new(
        booted.clone(),
        SimWatchdog::new(booted),
        Duration::from_secs(60),
    );
    let mut probes = all_pass();
    let [display, storage, bluetooth, audio] = &mut probes;
    let mut battery: [&mut dyn SubsystemProbe; 4] = [display, storage, bluetooth, audio];
    assert_eq!(
        validator.run_self_test(&mut battery),
        Ok(SelfTestOutcome::Committed)
    );
    assert!(probes.iter().all(|p| p.runs == 1));

    flash.power_cycle();
    let chip = flash.inspect();
    assert_eq!(chip.state(1), ImageState::Valid);
    assert_eq!(chip.running_slot(), 1);
}

#[test]
fn corrupt_image_is_never_booted() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(256 * 1024, 3);
    let mut tampered = image.clone();
    tampered[1000] ^= 0x01;
    let upload = console.upload(
        SegmentedBody::new(tampered, 4096),
        image.len(),
        to_hex(&sha256(&image)),
    );
    console.run_until_state(OtaState::Failed(ErrorCode::IntegrityCheckFailed));

    let err = upload.join().unwrap().unwrap_err();
    assert_eq!(err, TransferError::DigestMismatch);
    assert_eq!(err.http_status(), 422);
    assert_eq!(console.orch.system().restarts, 0);
    assert!(console.orch.radio().is_enabled());
    assert_eq!(
        console.orch.radio().notifications.last(),
        Some(&[1, 0xFF, ErrorCode::IntegrityCheckFailed.as_u8(), 100])
    );

    {
        let chip = flash.inspect();
        assert_eq!(chip.boot_target(), 0);
        assert_eq!(chip.state(1), ImageState::Empty);
    }
    flash.power_cycle();
    assert_eq!(flash.inspect().running_slot(), 0);

    // Once the user has seen the failure the console accepts a new attempt
    assert_eq!(
        console.orch.last_error(),
        Some(ErrorCode::IntegrityCheckFailed)
    );
    assert_eq!(console.tick(), OtaState::Idle);
    console.provision();
    assert_eq!(console.tick(), OtaState::ConnectingWifi);
}

#[test]
fn watchdog_reset_during_self_test_rolls_back() {
    let (flash, factory) = factory_flash();
    install_update(&flash);

    let booted = flash.boot();
    let watchdog = SimWatchdog::new(booted.clone());
    let fired = watchdog.fired_flag();
    let mut validator =
        PostUpdateValidator::new(booted, watchdog, Duration::from_millis(100));

    let mut display = SimProbe::new("display", ProbeBehaviour::Pass);
    let mut audio = SimProbe::new("audio", ProbeBehaviour::Hang(fired.clone()));
    let result = validator.run_self_test(&mut [&mut display, &mut audio]);

    assert!(fired.load(Ordering::SeqCst));
    assert!(matches!(result, Err(ValidatorError::Partition(_))));
    {
        let chip = flash.inspect();
        assert_eq!(chip.running_slot(), 0);
        assert_eq!(chip.boot_target(), 0);
        assert_eq!(chip.state(1), ImageState::Invalid);
        assert_eq!(&chip.slot(0)[..factory.len()], factory.as_slice());
    }

    let mut after = PostUpdateValidator::new(
        flash.boot(),
        SimWatchdog::new(flash.boot()),
        Duration::from_secs(60),
    );
    let mut display = SimProbe::new("display", ProbeBehaviour::Pass);
    assert_eq!(
        after.run_self_test(&mut [&mut display]),
        Ok(SelfTestOutcome::NotPending)
    );
    assert_eq!(display.runs, 0);
}

#[test]
fn rolled_back_update_is_reported_once_on_next_boot() {
    let (flash, _) = factory_flash();
    // Persisted "already reported" flag, as kept in NVS on the device
    let mut reported = false;
    install_update(&flash);

    let booted = flash.boot();
    let mut validator = PostUpdateValidator::new(
        booted.clone(),
        SimWatchdog::new(booted),
        Duration::from_secs(60),
    );
    assert_eq!(validator.take_rollback_notice(&mut reported), Ok(false));
    let mut storage = SimProbe::new("storage", ProbeBehaviour::Fail("NVS read back mismatch"));
    assert!(matches!(
        validator.run_self_test(&mut [&mut storage]),
        Ok(SelfTestOutcome::RolledBack { .. })
    ));

    // Previous firmware is running again
    let booted = flash.boot();
    let mut validator = PostUpdateValidator::new(
        booted.clone(),
        SimWatchdog::new(booted),
        Duration::from_secs(60),
    );
    assert_eq!(validator.take_rollback_notice(&mut reported), Ok(true));
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.orch.report_failure(ErrorCode::SelfTestFailed, Instant::now());
    assert_eq!(console.tick(), OtaState::Failed(ErrorCode::SelfTestFailed));
    assert_eq!(
        console.orch.radio().notifications.last(),
        Some(&[1, 0xFF, ErrorCode::SelfTestFailed.as_u8(), 0])
    );
    assert_eq!(console.orch.last_error(), Some(ErrorCode::SelfTestFailed));
    assert_eq!(console.tick(), OtaState::Idle);

    // A plain power cycle does not report the same rollback again
    flash.power_cycle();
    let booted = flash.boot();
    let mut validator = PostUpdateValidator::new(
        booted.clone(),
        SimWatchdog::new(booted),
        Duration::from_secs(60),
    );
    assert_eq!(validator.take_rollback_notice(&mut reported), Ok(false));
    assert!(reported);
}

#[test]
fn failing_probe_rolls_back_to_previous_image() {
    let (flash, _) = factory_flash();
    install_update(&flash);

    let booted = flash.boot();
    let mut validator = PostUpdateValidator::new(
        booted.clone(),
        SimWatchdog::new(booted),
        Duration::from_secs(60),
    );
    let mut display = SimProbe::new("display", ProbeBehaviour::Pass);
    let mut bluetooth = SimProbe::new("bluetooth", ProbeBehaviour::Fail("controller init failed"));
    let mut audio = SimProbe::new("audio", ProbeBehaviour::Pass);
    assert_eq!(
        validator.run_self_test(&mut [&mut display, &mut bluetooth, &mut audio]),
        Ok(SelfTestOutcome::RolledBack {
            subsystem: "bluetooth"
        })
    );
    assert_eq!(audio.runs, 0);

    let chip = flash.inspect();
    assert_eq!(chip.running_slot(), 0);
    assert_eq!(chip.state(1), ImageState::Invalid);
}

#[test]
fn wifi_exhaustion_fails_and_releases_station() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Rejecting);
    console.provision();

    assert_eq!(console.tick(), OtaState::ConnectingWifi);
    assert_eq!(console.tick(), OtaState::Failed(ErrorCode::WifiTimeout));

    let wifi = console.orch.wifi_driver();
    assert_eq!(wifi.connect_requests, u32::from(OtaConfig::default().wifi_max_attempts));
    assert!(wifi.releases >= 1);
    assert!(!wifi.is_configured());
    assert!(console.orch.radio().is_enabled());
    assert_eq!(console.orch.transfer().starts, 0);
    assert_eq!(console.orch.last_error(), Some(ErrorCode::WifiTimeout));
    assert_eq!(
        console.orch.error_message(),
        Some("Could not join the Wi-Fi network")
    );
}

#[test]
fn second_upload_is_refused_while_first_runs() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(128 * 1024, 9);
    let first = console.upload(
        SegmentedBody::new(image.clone(), 4096).paced(Duration::from_millis(3)),
        image.len(),
        to_hex(&sha256(&image)),
    );
    let link = console.endpoint.link().clone();
    let started = Instant::now();
    while !link.session_active() {
        assert!(started.elapsed() < Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(1));
    }

    let other = firmware_image(1024, 4);
    let second = console.endpoint.receive(
        Some("1024"),
        Some(to_hex(&sha256(&other)).as_str()),
        &mut SegmentedBody::new(other, 4096),
    );
    assert_eq!(second, Err(TransferError::Busy));
    assert_eq!(TransferError::Busy.http_status(), 409);

    assert_eq!(first.join().unwrap().map(|r| r.bytes), Ok(128 * 1024));
    console.run_until(Duration::from_secs(10), |orch| orch.system().restarts == 1);
}

#[test]
fn dropped_connection_keeps_previous_firmware() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(256 * 1024, 5);
    let upload = console.upload(
        SegmentedBody::new(image.clone(), 4096).cut_at(100 * 1024),
        image.len(),
        to_hex(&sha256(&image)),
    );
    console.run_until_state(OtaState::Failed(ErrorCode::TransferInterrupted));
    assert!(matches!(
        upload.join().unwrap(),
        Err(TransferError::Interrupted(_))
    ));

    let chip = flash.inspect();
    assert_eq!(chip.boot_target(), 0);
    assert_ne!(chip.state(1), ImageState::New);
}

#[test]
fn abort_after_verification_does_not_disown_armed_image() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(64 * 1024, 13);
    let upload = console.upload(
        SegmentedBody::new(image.clone(), 4096),
        image.len(),
        to_hex(&sha256(&image)),
    );
    console.run_until_state(OtaState::Rebooting);
    upload.join().unwrap().unwrap();

    assert!(console
        .bridge
        .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort)));
    assert_eq!(console.tick(), OtaState::Rebooting);

    console.run_until(Duration::from_secs(5), |orch| orch.system().restarts == 1);
    assert_eq!(console.orch.last_error(), None);
    let chip = flash.inspect();
    assert_eq!(chip.running_slot(), 1);
    assert_eq!(chip.state(1), ImageState::PendingVerify);
}

#[test]
fn abort_mid_transfer_cancels_session() {
    let (flash, _) = factory_flash();
    let mut console = Console::boot(&flash, Network::Reachable(CONSOLE_IP));
    console.provision();
    console.run_until_state(OtaState::WaitingForFirmware);

    let image = firmware_image(1024 * 1024, 11);
    let upload = console.upload(
        SegmentedBody::new(image.clone(), 4096).paced(Duration::from_millis(2)),
        image.len(),
        to_hex(&sha256(&image)),
    );
    console.run_until_state(OtaState::Receiving);

    assert!(console
        .bridge
        .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort)));
    assert_eq!(console.tick(), OtaState::Failed(ErrorCode::Aborted));

    assert_eq!(upload.join().unwrap(), Err(TransferError::Cancelled));
    assert!(!console.endpoint.link().session_active());
    assert!(console.orch.radio().is_enabled());
    assert_eq!(flash.inspect().boot_target(), 0);
}

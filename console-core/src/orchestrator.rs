//! Update orchestrator
//!
//! Owns the OTA state machine. The main loop calls `tick` at a fixed short
//! interval; each tick drains the bridge, then takes at most one transition
//! using non-blocking polls on the Wi-Fi module, the control radio and the
//! transfer link. Nothing in here waits.

use std::cell::Cell;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::{ControlRequest, Credentials, OtaBridge, ProgressEvent, ProvisioningEvent};
use crate::config::OtaConfig;
use crate::error::ErrorCode;
use crate::platform::{ControlRadio, SystemControl};
use crate::state::OtaState;
use crate::transfer::{TransferPhase, TransferService};
use crate::wifi::{WifiDriver, WifiModule};
use crate::wire::StatusPacket;

pub struct UpdateOrchestrator<W, R, T, S>
where
    W: WifiDriver,
    R: ControlRadio,
    T: TransferService,
    S: SystemControl,
{
    config: OtaConfig,
    bridge: Arc<OtaBridge>,
    wifi: WifiModule<W>,
    radio: R,
    transfer: T,
    system: S,

    state: OtaState,
    entered_at: Instant,
    last_activity: Instant,
    pending: Option<Credentials>,
    abort_requested: bool,
    address: Option<Ipv4Addr>,
    progress: Option<ProgressEvent>,
    last_error: Option<ErrorCode>,
    // Set by the UI-facing readers; gates Failed -> Idle
    failure_surfaced: Cell<bool>,
    radio_released: bool,
    restart_issued: bool,
    last_published: Option<StatusPacket>,
}

impl<W, R, T, S> UpdateOrchestrator<W, R, T, S>
where
    W: WifiDriver,
    R: ControlRadio,
    T: TransferService,
    S: SystemControl,
{
    pub fn new(
        config: OtaConfig,
        bridge: Arc<OtaBridge>,
        wifi: W,
        radio: R,
        transfer: T,
        system: S,
        now: Instant,
    ) -> Self {
        let wifi = WifiModule::new(wifi, config.wifi_max_attempts);
        Self {
            config,
            bridge,
            wifi,
            radio,
            transfer,
            system,
            state: OtaState::Idle,
            entered_at: now,
            last_activity: now,
            pending: None,
            abort_requested: false,
            address: None,
            progress: None,
            last_error: None,
            failure_surfaced: Cell::new(false),
            radio_released: false,
            restart_issued: false,
            last_published: None,
        }
    }

    /// One cooperative step. Never blocks.
    pub fn tick(&mut self, now: Instant) {
        self.transfer.poll();
        self.drain_events();

        if let Some(progress) = self.bridge.take_progress() {
            self.progress = Some(progress);
            self.last_activity = now;
        }

        if std::mem::take(&mut self.abort_requested) && self.state.is_abortable() {
            log::warn!("OTA: abort requested in {}", self.state);
            self.fail(ErrorCode::Aborted, now);
        } else {
            self.advance(now);
        }

        self.publish_status();
    }

    /// Show a failure found before the orchestrator started, such as an
    /// update rolled back on the previous boot. Only applies while `Idle`.
    pub fn report_failure(&mut self, code: ErrorCode, now: Instant) {
        if self.state == OtaState::Idle {
            self.fail(code, now);
        }
    }

    pub fn current_state(&self) -> OtaState {
        self.state
    }

    pub fn current_progress(&self) -> Option<ProgressEvent> {
        self.progress
    }

    /// Reason of the most recent failure. Reading it while `Failed` counts as
    /// surfacing the failure to the user.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.mark_surfaced();
        self.last_error
    }

    /// Localized text for `last_error`
    pub fn error_message(&self) -> Option<&'static str> {
        self.last_error()
            .map(|code| code.message(self.config.language))
    }

    pub fn status_packet(&self) -> StatusPacket {
        self.mark_surfaced();
        self.build_status()
    }

    /// Tunables this orchestrator runs with
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }
}

/// Access to the injected services for host tests and simulations
#[cfg(any(test, feature = "testing"))]
impl<W, R, T, S> UpdateOrchestrator<W, R, T, S>
where
    W: WifiDriver,
    R: ControlRadio,
    T: TransferService,
    S: SystemControl,
{
    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn wifi_driver(&self) -> &W {
        self.wifi.driver()
    }

    pub fn wifi_driver_mut(&mut self) -> &mut W {
        self.wifi.driver_mut()
    }
}

impl<W, R, T, S> UpdateOrchestrator<W, R, T, S>
where
    W: WifiDriver,
    R: ControlRadio,
    T: TransferService,
    S: SystemControl,
{
    fn mark_surfaced(&self) {
        if self.state.is_failed() {
            self.failure_surfaced.set(true);
        }
    }

    fn drain_events(&mut self) {
        for event in self.bridge.drain_provisioning_events() {
            match event {
                ProvisioningEvent::CredentialsReceived(credentials) => {
                    if self.state == OtaState::Idle && self.pending.is_none() {
                        log::info!("OTA: credentials received");
                        self.pending = Some(credentials);
                    } else {
                        log::debug!("OTA: credentials dropped in {}", self.state);
                    }
                }
                ProvisioningEvent::Control(ControlRequest::Abort) => {
                    if self.state.is_abortable() {
                        self.abort_requested = true;
                    } else if self.state == OtaState::Rebooting {
                        log::info!("OTA: abort ignored, new firmware already armed");
                    } else if self.pending.take().is_some() {
                        log::info!("OTA: pending credentials discarded by abort");
                    }
                }
            }
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.entered_at);

        match self.state {
            OtaState::Idle => {
                if let Some(credentials) = self.pending.take() {
                    self.progress = None;
                    self.last_error = None;
                    self.address = None;
                    match self.wifi.connect(credentials.ssid(), credentials.secret()) {
                        Ok(()) => self.enter(OtaState::ConnectingWifi, now),
                        Err(e) => {
                            log::error!("OTA: Wi-Fi connect failed: {}", e);
                            self.fail(ErrorCode::WifiAssociationFailed, now);
                        }
                    }
                }
            }
            OtaState::ConnectingWifi => {
                if let Some(address) = self.wifi.poll_connected() {
                    self.address = Some(address);
                    self.enter(OtaState::WifiConnected, now);
                } else if self.wifi.poll_failed() {
                    self.fail(ErrorCode::WifiTimeout, now);
                } else if elapsed >= self.config.wifi_connect_timeout() {
                    log::warn!("OTA: no Wi-Fi link after {:?}", elapsed);
                    self.fail(ErrorCode::WifiTimeout, now);
                }
            }
            OtaState::WifiConnected => {
                if let Some(address) = self.address {
                    self.radio.publish_address(address);
                }
                match self.radio.request_disable() {
                    Ok(()) => {
                        self.radio_released = true;
                        self.enter(OtaState::DisablingRadio, now);
                    }
                    Err(e) => {
                        log::error!("OTA: control radio refused to stop: {}", e);
                        self.fail(ErrorCode::RadioDisableFailed, now);
                    }
                }
            }
            OtaState::DisablingRadio => {
                if self.radio.is_disabled() {
                    match self.transfer.start() {
                        Ok(()) => self.enter(OtaState::StartingTransferServer, now),
                        Err(e) => {
                            log::error!("OTA: transfer server failed to start: {}", e);
                            self.fail(ErrorCode::ServerStartFailed, now);
                        }
                    }
                } else if elapsed >= self.config.radio_disable_timeout() {
                    self.fail(ErrorCode::RadioDisableFailed, now);
                }
            }
            OtaState::StartingTransferServer => {
                if self.transfer.is_listening() || self.transfer.phase() != TransferPhase::Idle {
                    self.enter(OtaState::WaitingForFirmware, now);
                } else if elapsed >= self.config.server_start_timeout() {
                    self.fail(ErrorCode::ServerStartFailed, now);
                }
            }
            OtaState::WaitingForFirmware => match self.transfer.phase() {
                TransferPhase::Receiving | TransferPhase::Verifying | TransferPhase::Complete => {
                    self.enter(OtaState::Receiving, now)
                }
                TransferPhase::Failed(code) => self.fail(code, now),
                _ if elapsed >= self.config.firmware_wait_timeout() => {
                    log::warn!("OTA: no upload within {:?}", elapsed);
                    self.fail(ErrorCode::TransferInterrupted, now);
                }
                _ => {}
            },
            OtaState::Receiving => match self.transfer.phase() {
                TransferPhase::Verifying | TransferPhase::Complete => {
                    self.enter(OtaState::Verifying, now)
                }
                TransferPhase::Failed(code) => self.fail(code, now),
                _ => {
                    let idle = now.saturating_duration_since(self.last_activity);
                    if idle >= self.config.chunk_inactivity_timeout() {
                        log::warn!("OTA: no data for {:?}", idle);
                        self.fail(ErrorCode::TransferInterrupted, now);
                    }
                }
            },
            OtaState::Verifying => match self.transfer.phase() {
                TransferPhase::Complete => self.enter(OtaState::Rebooting, now),
                TransferPhase::Failed(code) => self.fail(code, now),
                _ if elapsed >= self.config.verify_timeout() => {
                    self.fail(ErrorCode::TransferInterrupted, now);
                }
                _ => {}
            },
            OtaState::Rebooting => {
                if !self.restart_issued && elapsed >= self.config.reboot_delay() {
                    self.transfer.stop();
                    self.wifi.shutdown();
                    self.restart_issued = true;
                    log::info!("OTA: restarting into the new firmware");
                    self.system.restart();
                }
            }
            OtaState::Failed(_) => {
                if self.failure_surfaced.get() {
                    self.enter(OtaState::Idle, now);
                }
            }
        }
    }

    fn enter(&mut self, next: OtaState, now: Instant) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal OTA transition {} -> {}",
            self.state,
            next
        );
        log::info!("OTA: {} -> {}", self.state, next);
        self.state = next;
        self.entered_at = now;
        self.last_activity = now;
    }

    fn fail(&mut self, code: ErrorCode, now: Instant) {
        log::error!("OTA: {} failed: {}", self.state, code);
        self.teardown();
        self.last_error = Some(code);
        self.failure_surfaced.set(false);
        self.enter(OtaState::Failed(code), now);
    }

    /// Best effort; each step tolerates the resource never having started
    fn teardown(&mut self) {
        self.transfer.stop();
        self.wifi.shutdown();
        self.pending = None;
        self.address = None;
        if std::mem::take(&mut self.radio_released) {
            if let Err(e) = self.radio.enable() {
                log::warn!("OTA: could not re-enable control radio: {}", e);
            }
        }
    }

    fn build_status(&self) -> StatusPacket {
        let percent = match self.state {
            OtaState::Rebooting => 100,
            OtaState::Receiving | OtaState::Verifying | OtaState::Failed(_) => {
                self.progress.map(|p| p.percent).unwrap_or(0)
            }
            _ => 0,
        };
        StatusPacket::new(self.state, percent)
    }

    fn publish_status(&mut self) {
        let status = self.build_status();
        if self.last_published != Some(status) {
            self.radio.publish_status(&status);
            self.last_published = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRadio, FakeSystem, FakeTransfer, FakeWifi};
    use crate::transfer::{SessionSlot, TransferLink};
    use crate::wifi::LinkEvent;
    use proptest::prelude::*;
    use std::time::Duration;

    type TestOrchestrator = UpdateOrchestrator<FakeWifi, FakeRadio, FakeTransfer, FakeSystem>;

    struct Harness {
        orch: TestOrchestrator,
        bridge: Arc<OtaBridge>,
        link: Arc<TransferLink>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(FakeRadio::default(), FakeTransfer::default())
        }

        fn with(radio: FakeRadio, transfer: FakeTransfer) -> Self {
            let bridge = Arc::new(OtaBridge::new());
            let link = transfer.link.clone();
            let now = Instant::now();
            let orch = UpdateOrchestrator::new(
                OtaConfig::default(),
                bridge.clone(),
                FakeWifi::default(),
                radio,
                transfer,
                FakeSystem::default(),
                now,
            );
            Self {
                orch,
                bridge,
                link,
                now,
            }
        }

        fn tick(&mut self) -> OtaState {
            self.tick_after(Duration::from_millis(50))
        }

        fn tick_after(&mut self, delay: Duration) -> OtaState {
            self.now += delay;
            self.orch.tick(self.now);
            self.orch.current_state()
        }

        fn provision(&mut self) {
            let credentials = Credentials::new(b"HomeNet", b"secret123").unwrap();
            assert!(self
                .bridge
                .post_provisioning_event(ProvisioningEvent::CredentialsReceived(credentials)));
        }

        fn to_waiting_for_firmware(&mut self) {
            self.provision();
            assert_eq!(self.tick(), OtaState::ConnectingWifi);
            let wifi = self.orch.wifi_driver_mut();
            wifi.push(LinkEvent::Associated);
            wifi.push(LinkEvent::GotIp(Ipv4Addr::new(192, 168, 1, 50)));
            assert_eq!(self.tick(), OtaState::WifiConnected);
            assert_eq!(self.tick(), OtaState::DisablingRadio);
            assert_eq!(self.tick(), OtaState::StartingTransferServer);
            assert_eq!(self.tick(), OtaState::WaitingForFirmware);
        }
    }

    #[test]
    fn happy_path_reaches_single_restart() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        assert_eq!(h.orch.radio().addresses, vec![Ipv4Addr::new(192, 168, 1, 50)]);
        assert!(h.orch.radio().disabled);

        h.link.set_phase(TransferPhase::Receiving);
        h.bridge.post_progress(ProgressEvent::new(4096, 8192));
        assert_eq!(h.tick(), OtaState::Receiving);
        assert_eq!(h.orch.current_progress().map(|p| p.percent), Some(50));

        h.link.set_phase(TransferPhase::Verifying);
        assert_eq!(h.tick(), OtaState::Verifying);
        h.link.set_phase(TransferPhase::Complete);
        assert_eq!(h.tick(), OtaState::Rebooting);
        assert_eq!(h.orch.status_packet().percent, 100);

        h.tick_after(Duration::from_millis(1000));
        assert_eq!(h.orch.system().restarts, 0);
        h.tick_after(Duration::from_millis(1000));
        assert_eq!(h.orch.system().restarts, 1);
        h.tick_after(Duration::from_secs(5));
        assert_eq!(h.orch.system().restarts, 1);
        assert!(h.orch.wifi_driver().releases >= 1);
    }

    #[test]
    fn late_credentials_are_dropped() {
        let mut h = Harness::new();
        h.provision();
        h.tick();
        h.provision();
        assert_eq!(h.tick(), OtaState::ConnectingWifi);
        assert_eq!(h.orch.wifi_driver().connect_requests, 1);
    }

    #[test]
    fn abort_tears_down_and_reenables_radio() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        h.link.set_phase(TransferPhase::Receiving);
        assert_eq!(h.tick(), OtaState::Receiving);

        h.bridge
            .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::Aborted));
        assert!(h.orch.transfer().stops >= 1);
        assert!(!h.link.is_accepting());
        assert!(h.orch.wifi_driver().releases >= 1);
        assert_eq!(h.orch.radio().enable_calls, 1);
        assert!(!h.orch.radio().disabled);
    }

    #[test]
    fn boot_failure_is_surfaced_like_any_other() {
        let mut h = Harness::new();
        h.orch.report_failure(ErrorCode::SelfTestFailed, h.now);
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::SelfTestFailed));
        assert_eq!(
            h.orch.radio().statuses.last(),
            Some(&StatusPacket::new(OtaState::Failed(ErrorCode::SelfTestFailed), 0))
        );
        assert_eq!(h.orch.last_error(), Some(ErrorCode::SelfTestFailed));
        assert_eq!(h.tick(), OtaState::Idle);

        h.provision();
        h.tick();
        h.orch.report_failure(ErrorCode::SelfTestFailed, h.now);
        assert_eq!(h.orch.current_state(), OtaState::ConnectingWifi);
    }

    #[test]
    fn abort_in_idle_is_ignored() {
        let mut h = Harness::new();
        h.bridge
            .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
        assert_eq!(h.tick(), OtaState::Idle);
        assert_eq!(h.orch.last_error(), None);
    }

    #[test]
    fn failure_holds_until_surfaced() {
        let mut h = Harness::new();
        h.provision();
        h.tick();
        h.orch.wifi_driver_mut().push(LinkEvent::Disconnected);
        for _ in 0..5 {
            h.orch.wifi_driver_mut().push(LinkEvent::Disconnected);
        }
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::WifiTimeout));

        for _ in 0..10 {
            assert_eq!(h.tick(), OtaState::Failed(ErrorCode::WifiTimeout));
        }
        assert_eq!(h.orch.last_error(), Some(ErrorCode::WifiTimeout));
        assert_eq!(h.tick(), OtaState::Idle);
        assert_eq!(h.orch.last_error(), Some(ErrorCode::WifiTimeout));
    }

    #[test]
    fn failure_reported_by_main_loop_returns_to_idle() {
        let mut h = Harness::new();
        h.provision();

        // Same reporting pattern as the firmware loop: react to state changes only
        let mut last_state = OtaState::Idle;
        let mut seen = Vec::new();
        let mut messages = Vec::new();
        for _ in 0..40 {
            let state = h.tick_after(Duration::from_secs(1));
            if state != last_state {
                if state.is_failed() {
                    messages.extend(h.orch.error_message());
                }
                seen.push(state);
                last_state = state;
            }
        }

        assert_eq!(
            seen,
            vec![
                OtaState::ConnectingWifi,
                OtaState::Failed(ErrorCode::WifiTimeout),
                OtaState::Idle
            ]
        );
        assert_eq!(
            messages,
            vec![ErrorCode::WifiTimeout.message(crate::config::Language::English)]
        );

        h.provision();
        assert_eq!(h.tick(), OtaState::ConnectingWifi);
    }

    #[test]
    fn abort_after_image_is_armed_is_ignored() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        h.link.set_phase(TransferPhase::Receiving);
        h.tick();
        h.link.set_phase(TransferPhase::Complete);
        h.tick();
        assert_eq!(h.tick(), OtaState::Rebooting);

        h.bridge
            .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
        assert_eq!(h.tick(), OtaState::Rebooting);
        assert_eq!(h.orch.last_error(), None);

        h.tick_after(Duration::from_secs(3));
        assert_eq!(h.orch.system().restarts, 1);
    }

    #[test]
    fn abort_does_not_wait_for_the_running_upload() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        let link = h.link.clone();
        let session = SessionSlot::claim(&link).unwrap();
        link.set_phase(TransferPhase::Receiving);
        assert_eq!(h.tick(), OtaState::Receiving);

        h.bridge
            .post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::Aborted));
        assert!(link.cancel_requested());
        assert!(h.orch.transfer().retiring);
        assert_eq!(h.orch.transfer().releases, 0);

        h.tick();
        assert!(h.orch.transfer().retiring);

        drop(session);
        h.tick();
        assert!(!h.orch.transfer().retiring);
        assert_eq!(h.orch.transfer().releases, 1);
    }

    #[test]
    fn status_packet_read_also_surfaces() {
        let mut h = Harness::new();
        h.provision();
        h.tick();
        assert_eq!(
            h.tick_after(Duration::from_secs(31)),
            OtaState::Failed(ErrorCode::WifiTimeout)
        );
        let status = h.orch.status_packet();
        assert_eq!(status.encode()[1..3], [0xFF, ErrorCode::WifiTimeout.as_u8()]);
        assert_eq!(h.tick(), OtaState::Idle);
    }

    #[test]
    fn error_message_follows_language() {
        let mut h = Harness::new();
        h.orch.config.language = crate::config::Language::German;
        h.provision();
        h.tick();
        h.tick_after(Duration::from_secs(31));
        assert_eq!(
            h.orch.error_message(),
            Some("WLAN-Verbindung fehlgeschlagen")
        );
    }

    #[test]
    fn stuck_radio_fails_after_budget() {
        let radio = FakeRadio {
            stuck: true,
            ..FakeRadio::default()
        };
        let mut h = Harness::with(radio, FakeTransfer::default());
        h.provision();
        h.tick();
        h.orch
            .wifi_driver_mut()
            .push(LinkEvent::GotIp(Ipv4Addr::new(10, 0, 0, 2)));
        h.tick();
        assert_eq!(h.tick(), OtaState::DisablingRadio);
        assert_eq!(h.tick_after(Duration::from_secs(4)), OtaState::DisablingRadio);
        assert_eq!(
            h.tick_after(Duration::from_secs(2)),
            OtaState::Failed(ErrorCode::RadioDisableFailed)
        );
        assert_eq!(h.orch.transfer().starts, 0);
        assert_eq!(h.orch.radio().enable_calls, 1);
    }

    #[test]
    fn server_start_error_fails() {
        let transfer = FakeTransfer {
            fail_start: true,
            ..FakeTransfer::default()
        };
        let mut h = Harness::with(FakeRadio::default(), transfer);
        h.provision();
        h.tick();
        h.orch
            .wifi_driver_mut()
            .push(LinkEvent::GotIp(Ipv4Addr::new(10, 0, 0, 2)));
        h.tick();
        h.tick();
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::ServerStartFailed));
    }

    #[test]
    fn stalled_upload_times_out() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        h.link.set_phase(TransferPhase::Receiving);
        assert_eq!(h.tick(), OtaState::Receiving);

        h.bridge.post_progress(ProgressEvent::new(100, 1000));
        assert_eq!(h.tick_after(Duration::from_secs(10)), OtaState::Receiving);
        assert_eq!(h.tick_after(Duration::from_secs(10)), OtaState::Receiving);
        assert_eq!(
            h.tick_after(Duration::from_secs(16)),
            OtaState::Failed(ErrorCode::TransferInterrupted)
        );
    }

    #[test]
    fn no_upload_times_out() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        assert_eq!(
            h.tick_after(Duration::from_secs(301)),
            OtaState::Failed(ErrorCode::TransferInterrupted)
        );
    }

    #[test]
    fn transfer_failure_code_is_propagated() {
        let mut h = Harness::new();
        h.to_waiting_for_firmware();
        h.link.set_phase(TransferPhase::Receiving);
        h.tick();
        h.link.set_phase(TransferPhase::Verifying);
        h.tick();
        h.link
            .set_phase(TransferPhase::Failed(ErrorCode::IntegrityCheckFailed));
        assert_eq!(h.tick(), OtaState::Failed(ErrorCode::IntegrityCheckFailed));
        assert_eq!(h.orch.system().restarts, 0);
    }

    #[test]
    fn status_is_published_only_on_change() {
        let mut h = Harness::new();
        h.tick();
        h.tick();
        assert_eq!(h.orch.radio().statuses.len(), 1);
        h.provision();
        h.tick();
        assert_eq!(h.orch.radio().statuses.len(), 2);
        assert_eq!(
            h.orch.radio().statuses[1],
            StatusPacket::new(OtaState::ConnectingWifi, 0)
        );
    }

    #[derive(Debug, Clone)]
    enum Step {
        Credentials,
        Abort,
        Associated,
        GotIp,
        Disconnected,
        Phase(u8),
        Progress(u32),
        Wait(u64),
        Surface,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Credentials),
            Just(Step::Abort),
            Just(Step::Associated),
            Just(Step::GotIp),
            Just(Step::Disconnected),
            (0u8..6).prop_map(Step::Phase),
            (0u32..=1000).prop_map(Step::Progress),
            (0u64..40_000).prop_map(Step::Wait),
            Just(Step::Surface),
        ]
    }

    fn phase(n: u8) -> TransferPhase {
        match n {
            0 => TransferPhase::Idle,
            1 => TransferPhase::Listening,
            2 => TransferPhase::Receiving,
            3 => TransferPhase::Verifying,
            4 => TransferPhase::Complete,
            _ => TransferPhase::Failed(ErrorCode::TransferInterrupted),
        }
    }

    proptest! {
        #[test]
        fn every_tick_takes_at_most_one_legal_edge(steps in proptest::collection::vec(step(), 1..150)) {
            let mut h = Harness::new();
            for step in steps {
                let mut delay = Duration::from_millis(50);
                match step {
                    Step::Credentials => h.provision(),
                    Step::Abort => {
                        h.bridge.post_provisioning_event(ProvisioningEvent::Control(ControlRequest::Abort));
                    }
                    Step::Associated => h.orch.wifi_driver_mut().push(LinkEvent::Associated),
                    Step::GotIp => h.orch.wifi_driver_mut().push(LinkEvent::GotIp(Ipv4Addr::new(10, 0, 0, 9))),
                    Step::Disconnected => h.orch.wifi_driver_mut().push(LinkEvent::Disconnected),
                    Step::Phase(n) => h.link.set_phase(phase(n)),
                    Step::Progress(n) => h.bridge.post_progress(ProgressEvent::new(n, 1000)),
                    Step::Wait(ms) => delay = Duration::from_millis(ms),
                    Step::Surface => {
                        let _ = h.orch.last_error();
                    }
                }
                let before = h.orch.current_state();
                let after = h.tick_after(delay);
                prop_assert!(
                    before == after || before.can_transition_to(after),
                    "illegal edge {} -> {}", before, after
                );
                prop_assert!(h.orch.system().restarts <= 1);
            }
        }
    }
}

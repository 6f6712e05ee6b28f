use anyhow::{anyhow, Result};
use console_core::{Credentials, LinkEvent, WifiDriver};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use esp_idf_hal::modem::WifiModemPeripheral;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_sys::{esp, esp_wifi_set_storage, wifi_storage_t_WIFI_STORAGE_RAM};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    netif::IpEvent,
    wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent},
};

// Filled from the system event task, drained by the orchestrator tick
static LINK_EVENTS: Channel<CriticalSectionRawMutex, LinkEvent, 8> = Channel::new();

fn post_link_event(event: LinkEvent) {
    if LINK_EVENTS.try_send(event).is_err() {
        log::warn!("Wi-Fi link event dropped: {:?}", event);
    }
}

fn drain_link_events() {
    while LINK_EVENTS.try_receive().is_ok() {}
}

/// Station-mode driver that never blocks: connect requests return at once
/// and link changes arrive as system events.
pub struct EspWifiDriver {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    subscriptions: Vec<EspSubscription<'static, System>>,
}

impl EspWifiDriver {
    pub fn new<M: WifiModemPeripheral>(
        modem: impl Peripheral<P = M> + 'static,
        sys_loop: EspSystemEventLoop,
    ) -> Result<Self> {
        // No NVS handle: station config, SSID and password included, stays in RAM
        let wifi = EspWifi::new(modem, sys_loop.clone(), None)?;
        esp!(unsafe { esp_wifi_set_storage(wifi_storage_t_WIFI_STORAGE_RAM) })?;
        log::info!("WiFi driver initialized (station idle)");
        Ok(Self {
            wifi,
            sys_loop,
            subscriptions: Vec::new(),
        })
    }

    fn subscribe(&mut self) -> Result<()> {
        if !self.subscriptions.is_empty() {
            return Ok(());
        }
        let link = self.sys_loop.subscribe::<WifiEvent, _>(|event| match event {
            WifiEvent::StaConnected(_) => post_link_event(LinkEvent::Associated),
            WifiEvent::StaDisconnected(_) => post_link_event(LinkEvent::Disconnected),
            _ => {}
        })?;
        let ip = self.sys_loop.subscribe::<IpEvent, _>(|event| {
            if let IpEvent::DhcpIpAssigned(assignment) = event {
                post_link_event(LinkEvent::GotIp(assignment.ip()));
            }
        })?;
        self.subscriptions.push(link);
        self.subscriptions.push(ip);
        Ok(())
    }
}

impl WifiDriver for EspWifiDriver {
    type Error = anyhow::Error;

    fn configure(&mut self, credentials: &Credentials) -> Result<()> {
        let ssid = std::str::from_utf8(credentials.ssid())
            .map_err(|_| anyhow!("SSID is not valid UTF-8"))?;
        let password = std::str::from_utf8(credentials.secret())
            .map_err(|_| anyhow!("password is not valid UTF-8"))?;

        let cfg = Configuration::Client(ClientConfiguration {
            ssid: heapless::String::<32>::try_from(ssid)
                .map_err(|_| anyhow!("Invalid SSID format"))?,
            password: heapless::String::<64>::try_from(password)
                .map_err(|_| anyhow!("Invalid password format"))?,
            auth_method: if credentials.is_open() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        log::info!("Setting WiFi configuration (SSID of {} bytes)", ssid.len());
        self.wifi.set_configuration(&cfg)?;
        drain_link_events();
        Ok(())
    }

    fn begin_connect(&mut self) -> Result<()> {
        self.subscribe()?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        log::debug!("WiFi association requested");
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        LINK_EVENTS.try_receive().ok()
    }

    fn release(&mut self) {
        self.subscriptions.clear();
        if self.wifi.is_started().unwrap_or(false) {
            if let Err(e) = self.wifi.disconnect() {
                log::debug!("WiFi disconnect on release: {:?}", e);
            }
            if let Err(e) = self.wifi.stop() {
                log::warn!("Failed to stop WiFi: {:?}", e);
            }
        }
        // Drop the RAM copy of the credentials
        if let Err(e) = self
            .wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
        {
            log::debug!("WiFi config reset on release: {:?}", e);
        }
        drain_link_events();
        log::info!("WiFi station released");
    }
}

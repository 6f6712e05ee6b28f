// BLE GATT provisioning service: the console's control radio
//
// One primary service with three characteristics:
//   credentials  write           versioned Wi-Fi credential frame
//   status       read + notify   versioned OTA status frame
//   address      read + notify   station IPv4 address, network order
//
// The Bluedroid callbacks run on the BTC task. They only touch the atomics
// below and the bridge's non-blocking post functions.

use core::fmt;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use console_core::wire::{encode_address, StatusPacket};
use console_core::{ControlRadio, OtaBridge};
use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_sys as sys;
use log::{debug, error, info, warn};

const APP_ID: u16 = 0x4f54;
const DEVICE_NAME: &str = "DriverConsole";
const LOCAL_MTU: u16 = 256;
const SERVICE_HANDLES: u16 = 12;
// Largest credential frame: version, two length bytes, 32 + 64 payload
const MAX_CREDENTIAL_FRAME: usize = 99;

const SERVICE_UUID: [u8; 16] = 0x7d2a0001_5c4e_4b8a_9f1e_3b6c0d2e8a10u128.to_le_bytes();
const CREDENTIALS_UUID: [u8; 16] = 0x7d2a0002_5c4e_4b8a_9f1e_3b6c0d2e8a10u128.to_le_bytes();
const STATUS_UUID: [u8; 16] = 0x7d2a0003_5c4e_4b8a_9f1e_3b6c0d2e8a10u128.to_le_bytes();
const ADDRESS_UUID: [u8; 16] = 0x7d2a0004_5c4e_4b8a_9f1e_3b6c0d2e8a10u128.to_le_bytes();

static BRIDGE: OnceLock<Arc<OtaBridge>> = OnceLock::new();

static GATT_INTERFACE: AtomicU8 = AtomicU8::new(sys::ESP_GATT_IF_NONE as u8);
static SERVICE_HANDLE: AtomicU16 = AtomicU16::new(0);
static CREDENTIALS_HANDLE: AtomicU16 = AtomicU16::new(0);
static STATUS_HANDLE: AtomicU16 = AtomicU16::new(0);
static ADDRESS_HANDLE: AtomicU16 = AtomicU16::new(0);
static CONN_ID: AtomicU16 = AtomicU16::new(0);
static CONNECTED: AtomicBool = AtomicBool::new(false);
static RADIO_ENABLED: AtomicBool = AtomicBool::new(false);
static STATUS_VALUE: AtomicU32 = AtomicU32::new(0);
static ADDRESS_VALUE: AtomicU32 = AtomicU32::new(0);

// Long-write (prepare/execute) assembly for the credential characteristic
static PREPARED: Mutex<heapless::Vec<u8, MAX_CREDENTIAL_FRAME>> = Mutex::new(heapless::Vec::new());

#[derive(Debug, Clone, PartialEq)]
pub enum BleError {
    Esp(&'static str, sys::esp_err_t),
    AlreadyStarted,
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleError::Esp(context, code) => write!(f, "{} failed: ESP error {}", context, code),
            BleError::AlreadyStarted => write!(f, "provisioning service already started"),
        }
    }
}

impl std::error::Error for BleError {}

fn call_esp_api(result: sys::esp_err_t, context: &'static str) -> Result<(), BleError> {
    if result == sys::ESP_OK {
        Ok(())
    } else {
        Err(BleError::Esp(context, result))
    }
}

fn uuid128(bytes: [u8; 16]) -> sys::esp_bt_uuid_t {
    sys::esp_bt_uuid_t {
        len: sys::ESP_UUID_LEN_128 as u16,
        uuid: sys::esp_bt_uuid_t__bindgen_ty_1 { uuid128: bytes },
    }
}

fn uuid16(value: u16) -> sys::esp_bt_uuid_t {
    sys::esp_bt_uuid_t {
        len: sys::ESP_UUID_LEN_16 as u16,
        uuid: sys::esp_bt_uuid_t__bindgen_ty_1 { uuid16: value },
    }
}

/// Provisioning radio backed by the Bluedroid GATT server
pub struct BleControlRadio {
    _driver: BtDriver<'static, Ble>,
}

impl BleControlRadio {
    /// Register the GATT application; the service, characteristics and
    /// advertising follow from the stack's events.
    pub fn start(driver: BtDriver<'static, Ble>, bridge: Arc<OtaBridge>) -> Result<Self, BleError> {
        BRIDGE.set(bridge).map_err(|_| BleError::AlreadyStarted)?;
        register_application()?;
        info!("BLE provisioning service registering as '{}'", DEVICE_NAME);
        Ok(Self { _driver: driver })
    }
}

fn register_application() -> Result<(), BleError> {
    call_esp_api(
        unsafe { sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
        "GATT callback registration",
    )?;
    call_esp_api(
        unsafe { sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
        "GAP callback registration",
    )?;
    call_esp_api(unsafe { sys::esp_ble_gatt_set_local_mtu(LOCAL_MTU) }, "Local MTU")?;
    call_esp_api(unsafe { sys::esp_ble_gatts_app_register(APP_ID) }, "GATT app registration")?;
    RADIO_ENABLED.store(true, Ordering::SeqCst);
    Ok(())
}

fn update_characteristic(handle: &AtomicU16, value: &[u8]) {
    let handle = handle.load(Ordering::SeqCst);
    if handle == 0 || !RADIO_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let set = unsafe { sys::esp_ble_gatts_set_attr_value(handle, value.len() as u16, value.as_ptr()) };
    if set != sys::ESP_OK {
        warn!("BLE attribute update failed: {}", set);
        return;
    }
    if CONNECTED.load(Ordering::SeqCst) {
        let mut buf = [0u8; 4];
        buf[..value.len()].copy_from_slice(value);
        let sent = unsafe {
            sys::esp_ble_gatts_send_indicate(
                GATT_INTERFACE.load(Ordering::SeqCst) as sys::esp_gatt_if_t,
                CONN_ID.load(Ordering::SeqCst),
                handle,
                value.len() as u16,
                buf.as_mut_ptr(),
                false,
            )
        };
        if sent != sys::ESP_OK {
            debug!("BLE notification not sent: {}", sent);
        }
    }
}

impl ControlRadio for BleControlRadio {
    type Error = BleError;

    fn publish_status(&mut self, status: &StatusPacket) {
        let frame = status.encode();
        STATUS_VALUE.store(u32::from_le_bytes(frame), Ordering::SeqCst);
        update_characteristic(&STATUS_HANDLE, &frame);
    }

    fn publish_address(&mut self, address: Ipv4Addr) {
        let frame = encode_address(address);
        ADDRESS_VALUE.store(u32::from_le_bytes(frame), Ordering::SeqCst);
        update_characteristic(&ADDRESS_HANDLE, &frame);
    }

    fn request_disable(&mut self) -> Result<(), BleError> {
        info!("Switching BLE off for the firmware transfer");
        RADIO_ENABLED.store(false, Ordering::SeqCst);
        let stop = unsafe { sys::esp_ble_gap_stop_advertising() };
        if stop != sys::ESP_OK {
            debug!("Advertising stop returned {}", stop);
        }
        if CONNECTED.swap(false, Ordering::SeqCst) {
            let close = unsafe {
                sys::esp_ble_gatts_close(
                    GATT_INTERFACE.load(Ordering::SeqCst) as sys::esp_gatt_if_t,
                    CONN_ID.load(Ordering::SeqCst),
                )
            };
            if close != sys::ESP_OK {
                debug!("GATT close returned {}", close);
            }
        }
        // Bluedroid forgets the application on disable; handles are reassigned
        for handle in [&SERVICE_HANDLE, &CREDENTIALS_HANDLE, &STATUS_HANDLE, &ADDRESS_HANDLE] {
            handle.store(0, Ordering::SeqCst);
        }
        call_esp_api(unsafe { sys::esp_bluedroid_disable() }, "Bluedroid disable")?;
        call_esp_api(unsafe { sys::esp_bt_controller_disable() }, "BT controller disable")?;
        Ok(())
    }

    fn is_disabled(&self) -> bool {
        let status = unsafe { sys::esp_bt_controller_get_status() };
        status != sys::esp_bt_controller_status_t_ESP_BT_CONTROLLER_STATUS_ENABLED
    }

    fn enable(&mut self) -> Result<(), BleError> {
        if !self.is_disabled() {
            return Ok(());
        }
        info!("Switching BLE back on");
        call_esp_api(
            unsafe { sys::esp_bt_controller_enable(sys::esp_bt_mode_t_ESP_BT_MODE_BLE) },
            "BT controller enable",
        )?;
        call_esp_api(unsafe { sys::esp_bluedroid_enable() }, "Bluedroid enable")?;
        register_application()
    }
}

fn add_characteristic(uuid: [u8; 16], perm: u32, props: u32, initial: Option<u32>) {
    let service = SERVICE_HANDLE.load(Ordering::SeqCst);
    let mut char_uuid = uuid128(uuid);
    let mut value = initial.unwrap_or(0).to_le_bytes();
    let mut attr_value = sys::esp_attr_value_t {
        attr_max_len: 4,
        attr_len: 4,
        attr_value: value.as_mut_ptr(),
    };
    // Credentials are answered by the application; the rest by the stack
    let mut control = sys::esp_attr_control_t {
        auto_rsp: if initial.is_some() {
            sys::ESP_GATT_AUTO_RSP as u8
        } else {
            sys::ESP_GATT_RSP_BY_APP as u8
        },
    };
    let result = unsafe {
        sys::esp_ble_gatts_add_char(
            service,
            &mut char_uuid,
            perm as sys::esp_gatt_perm_t,
            props as sys::esp_gatt_char_prop_t,
            if initial.is_some() { &mut attr_value } else { core::ptr::null_mut() },
            &mut control,
        )
    };
    if let Err(e) = call_esp_api(result, "Characteristic creation") {
        error!("{}", e);
    }
}

fn add_notify_descriptor() {
    let service = SERVICE_HANDLE.load(Ordering::SeqCst);
    let mut cccd_uuid = uuid16(sys::ESP_GATT_UUID_CHAR_CLIENT_CONFIG as u16);
    let result = unsafe {
        sys::esp_ble_gatts_add_char_descr(
            service,
            &mut cccd_uuid,
            (sys::ESP_GATT_PERM_READ | sys::ESP_GATT_PERM_WRITE) as sys::esp_gatt_perm_t,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        )
    };
    if let Err(e) = call_esp_api(result, "Notify descriptor creation") {
        error!("{}", e);
    }
}

fn start_advertising() {
    let mut adv_params = sys::esp_ble_adv_params_t {
        adv_int_min: 0x20,
        adv_int_max: 0x40,
        adv_type: sys::esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        peer_addr: [0; 6],
        peer_addr_type: sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
    };
    match call_esp_api(
        unsafe { sys::esp_ble_gap_start_advertising(&mut adv_params) },
        "Advertising start",
    ) {
        Ok(()) => info!("BLE advertising as '{}'", DEVICE_NAME),
        Err(e) => error!("{}", e),
    }
}

fn configure_advertising() {
    let Ok(name) = CString::new(DEVICE_NAME) else {
        return;
    };
    if let Err(e) = call_esp_api(
        unsafe { sys::esp_ble_gap_set_device_name(name.as_ptr()) },
        "Device name",
    ) {
        error!("{}", e);
    }
    let mut service_uuid = SERVICE_UUID;
    let mut adv_data = sys::esp_ble_adv_data_t {
        set_scan_rsp: false,
        include_name: true,
        include_txpower: false,
        min_interval: 0x0006,
        max_interval: 0x0010,
        appearance: 0x00,
        manufacturer_len: 0,
        p_manufacturer_data: core::ptr::null_mut(),
        service_data_len: 0,
        p_service_data: core::ptr::null_mut(),
        service_uuid_len: service_uuid.len() as u16,
        p_service_uuid: service_uuid.as_mut_ptr(),
        flag: (sys::ESP_BLE_ADV_FLAG_GEN_DISC | sys::ESP_BLE_ADV_FLAG_BREDR_NOT_SPT) as u8,
    };
    if let Err(e) = call_esp_api(
        unsafe { sys::esp_ble_gap_config_adv_data(&mut adv_data) },
        "Advertising data",
    ) {
        error!("{}", e);
    }
}

fn respond(write: &sys::esp_ble_gatts_cb_param_t_gatts_write_evt_param, status: sys::esp_gatt_status_t) {
    if !write.need_rsp {
        return;
    }
    let mut rsp: sys::esp_gatt_rsp_t = unsafe { core::mem::zeroed() };
    let gatts_if = GATT_INTERFACE.load(Ordering::SeqCst) as sys::esp_gatt_if_t;
    let result = unsafe {
        if write.is_prep {
            // Prepare writes echo the received fragment
            let len = (write.len as usize).min(rsp.attr_value.value.len());
            rsp.attr_value.handle = write.handle;
            rsp.attr_value.offset = write.offset;
            rsp.attr_value.len = len as u16;
            rsp.attr_value.auth_req = sys::ESP_GATT_AUTH_REQ_NONE as u8;
            let data = std::slice::from_raw_parts(write.value, len);
            rsp.attr_value.value[..len].copy_from_slice(data);
        }
        sys::esp_ble_gatts_send_response(gatts_if, write.conn_id, write.trans_id, status, &mut rsp)
    };
    if result != sys::ESP_OK {
        debug!("GATT write response failed: {}", result);
    }
}

fn deliver_credential_frame(frame: &[u8]) -> sys::esp_gatt_status_t {
    let Some(bridge) = BRIDGE.get() else {
        return sys::esp_gatt_status_t_ESP_GATT_ERROR;
    };
    // Frame content is secret; only its size is logged
    match bridge.post_credential_frame(frame) {
        Ok(true) => {
            info!("Credential frame received ({} bytes)", frame.len());
            sys::esp_gatt_status_t_ESP_GATT_OK
        }
        Ok(false) => sys::esp_gatt_status_t_ESP_GATT_BUSY,
        Err(e) => {
            warn!("Credential frame rejected: {}", e);
            sys::esp_gatt_status_t_ESP_GATT_INVALID_ATTR_LEN
        }
    }
}

fn handle_credentials_write(write: &sys::esp_ble_gatts_cb_param_t_gatts_write_evt_param) {
    if write.value.is_null() {
        respond(write, sys::esp_gatt_status_t_ESP_GATT_INVALID_ATTR_LEN);
        return;
    }
    let data = unsafe { std::slice::from_raw_parts(write.value, write.len as usize) };

    if write.is_prep {
        let status = match PREPARED.lock() {
            Ok(mut buf) => {
                if write.offset == 0 {
                    buf.clear();
                }
                if write.offset as usize != buf.len() || buf.extend_from_slice(data).is_err() {
                    buf.clear();
                    sys::esp_gatt_status_t_ESP_GATT_INVALID_OFFSET
                } else {
                    sys::esp_gatt_status_t_ESP_GATT_OK
                }
            }
            Err(_) => sys::esp_gatt_status_t_ESP_GATT_ERROR,
        };
        respond(write, status);
        return;
    }

    let status = deliver_credential_frame(data);
    respond(write, status);
}

fn handle_execute_write(exec: &sys::esp_ble_gatts_cb_param_t_gatts_exec_write_evt_param) {
    let frame = match PREPARED.lock() {
        Ok(mut buf) => {
            let frame = buf.clone();
            buf.clear();
            frame
        }
        Err(_) => heapless::Vec::new(),
    };
    if exec.exec_write_flag == sys::ESP_GATT_PREP_WRITE_EXEC as u8 && !frame.is_empty() {
        deliver_credential_frame(&frame);
    }
    let result = unsafe {
        sys::esp_ble_gatts_send_response(
            GATT_INTERFACE.load(Ordering::SeqCst) as sys::esp_gatt_if_t,
            exec.conn_id,
            exec.trans_id,
            sys::esp_gatt_status_t_ESP_GATT_OK,
            core::ptr::null_mut(),
        )
    };
    if result != sys::ESP_OK {
        debug!("GATT execute response failed: {}", result);
    }
}

extern "C" fn gatts_event_handler(
    event: sys::esp_gatts_cb_event_t,
    gatt_interface: sys::esp_gatt_if_t,
    param: *mut sys::esp_ble_gatts_cb_param_t,
) {
    // Unwinding into C is undefined; contain it here
    let result = std::panic::catch_unwind(|| gatts_event(event, gatt_interface, param));
    if result.is_err() {
        error!("Panic in GATT event handler (event {})", event);
    }
}

fn gatts_event(
    event: sys::esp_gatts_cb_event_t,
    gatt_interface: sys::esp_gatt_if_t,
    param: *mut sys::esp_ble_gatts_cb_param_t,
) {
    if param.is_null() {
        return;
    }
    let param = unsafe { &*param };

    match event {
        sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            GATT_INTERFACE.store(gatt_interface as u8, Ordering::SeqCst);
            let mut service_id = sys::esp_gatt_srvc_id_t {
                is_primary: true,
                id: sys::esp_gatt_id_t {
                    uuid: uuid128(SERVICE_UUID),
                    inst_id: 0,
                },
            };
            if let Err(e) = call_esp_api(
                unsafe {
                    sys::esp_ble_gatts_create_service(gatt_interface, &mut service_id, SERVICE_HANDLES)
                },
                "GATT service creation",
            ) {
                error!("{}", e);
            }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let create = unsafe { &param.create };
            SERVICE_HANDLE.store(create.service_handle, Ordering::SeqCst);
            add_characteristic(
                CREDENTIALS_UUID,
                sys::ESP_GATT_PERM_WRITE,
                sys::ESP_GATT_CHAR_PROP_BIT_WRITE,
                None,
            );
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let add = unsafe { &param.add_char };
            let uuid = unsafe { add.char_uuid.uuid.uuid128 };
            if uuid == CREDENTIALS_UUID {
                CREDENTIALS_HANDLE.store(add.attr_handle, Ordering::SeqCst);
                add_characteristic(
                    STATUS_UUID,
                    sys::ESP_GATT_PERM_READ,
                    sys::ESP_GATT_CHAR_PROP_BIT_READ | sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY,
                    Some(STATUS_VALUE.load(Ordering::SeqCst)),
                );
            } else if uuid == STATUS_UUID {
                STATUS_HANDLE.store(add.attr_handle, Ordering::SeqCst);
                add_notify_descriptor();
            } else if uuid == ADDRESS_UUID {
                ADDRESS_HANDLE.store(add.attr_handle, Ordering::SeqCst);
                add_notify_descriptor();
            }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
            if ADDRESS_HANDLE.load(Ordering::SeqCst) == 0 {
                add_characteristic(
                    ADDRESS_UUID,
                    sys::ESP_GATT_PERM_READ,
                    sys::ESP_GATT_CHAR_PROP_BIT_READ | sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY,
                    Some(ADDRESS_VALUE.load(Ordering::SeqCst)),
                );
            } else {
                let service = SERVICE_HANDLE.load(Ordering::SeqCst);
                if let Err(e) = call_esp_api(
                    unsafe { sys::esp_ble_gatts_start_service(service) },
                    "GATT service start",
                ) {
                    error!("{}", e);
                }
            }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_START_EVT => {
            info!("Provisioning service started");
            configure_advertising();
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect = unsafe { &param.connect };
            CONN_ID.store(connect.conn_id, Ordering::SeqCst);
            CONNECTED.store(true, Ordering::SeqCst);
            info!("Companion app connected");
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            CONNECTED.store(false, Ordering::SeqCst);
            info!("Companion app disconnected");
            if RADIO_ENABLED.load(Ordering::SeqCst) {
                start_advertising();
            }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write = unsafe { &param.write };
            if write.handle == CREDENTIALS_HANDLE.load(Ordering::SeqCst) {
                handle_credentials_write(write);
            }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_EXEC_WRITE_EVT => {
            let exec = unsafe { &param.exec_write };
            handle_execute_write(exec);
        }
        _ => {}
    }
}

extern "C" fn gap_event_handler(
    event: sys::esp_gap_ble_cb_event_t,
    _param: *mut sys::esp_ble_gap_cb_param_t,
) {
    if event == sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT
        && RADIO_ENABLED.load(Ordering::SeqCst)
    {
        let result = std::panic::catch_unwind(start_advertising);
        if result.is_err() {
            error!("Panic in GAP event handler");
        }
    }
}

pub mod wifi;

pub use wifi::EspWifiDriver;

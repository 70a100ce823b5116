//! Build-time configuration. Every key can be overridden from the
//! environment of the `cargo build` that produces the firmware.

use core::str::FromStr;

use log::warn;

use crate::gpio::PinId;
use crate::sensors::dht::DhtKind;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build number forwarded by `build.rs`.
pub const APP_BUILD: &str = match option_env!("APP_BUILD") {
    Some(v) => v,
    None => "0",
};

const DEVICE_NAME: &str = match option_env!("DEVICE_NAME") {
    Some(v) => v,
    None => "dio-seq",
};
const WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(v) => v,
    None => "YOUR_WIFI_SSID",
};
const WIFI_PASS: &str = match option_env!("WIFI_PASS") {
    Some(v) => v,
    None => "",
};

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub device_name: String,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub dht_gpio: PinId,
    pub dht_kind: DhtKind,
    pub dht_poll_ms: u32,
    pub dht_buffer_len: usize,
    pub max6675_cs_gpio: PinId,
    pub max6675_sck_gpio: PinId,
    pub max6675_so_gpio: PinId,
    pub max6675_poll_ms: u32,
    pub max6675_buffer_len: usize,
    /// Output pin of the loopback test bench.
    pub test_out_gpio: PinId,
    /// Input pin of the loopback test bench, also its second output.
    pub test_in_gpio: PinId,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.into(),
            wifi_ssid: WIFI_SSID.into(),
            wifi_pass: WIFI_PASS.into(),
            dht_gpio: 4,
            dht_kind: DhtKind::Dht22,
            dht_poll_ms: 2_000,
            dht_buffer_len: 12,
            max6675_cs_gpio: 7,
            max6675_sck_gpio: 10,
            max6675_so_gpio: 11,
            max6675_poll_ms: 1_000,
            max6675_buffer_len: 12,
            test_out_gpio: 5,
            test_in_gpio: 6,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with whatever was set at build time.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        parse_env("DHT_GPIO", option_env!("DHT_GPIO"), &mut cfg.dht_gpio);
        parse_env("DHT_KIND", option_env!("DHT_KIND"), &mut cfg.dht_kind);
        parse_env("DHT_POLL_MS", option_env!("DHT_POLL_MS"), &mut cfg.dht_poll_ms);
        parse_env("DHT_BUFFER_LEN", option_env!("DHT_BUFFER_LEN"), &mut cfg.dht_buffer_len);
        parse_env("MAX6675_CS_GPIO", option_env!("MAX6675_CS_GPIO"), &mut cfg.max6675_cs_gpio);
        parse_env("MAX6675_SCK_GPIO", option_env!("MAX6675_SCK_GPIO"), &mut cfg.max6675_sck_gpio);
        parse_env("MAX6675_SO_GPIO", option_env!("MAX6675_SO_GPIO"), &mut cfg.max6675_so_gpio);
        parse_env("MAX6675_POLL_MS", option_env!("MAX6675_POLL_MS"), &mut cfg.max6675_poll_ms);
        parse_env(
            "MAX6675_BUFFER_LEN",
            option_env!("MAX6675_BUFFER_LEN"),
            &mut cfg.max6675_buffer_len,
        );
        parse_env("TEST_OUT_GPIO", option_env!("TEST_OUT_GPIO"), &mut cfg.test_out_gpio);
        parse_env("TEST_IN_GPIO", option_env!("TEST_IN_GPIO"), &mut cfg.test_in_gpio);
        cfg
    }

    pub fn firmware_version(&self) -> String {
        format!("{APP_VERSION}+{APP_BUILD}")
    }
}

/// Overwrite `slot` with `raw` when it parses; keep the default otherwise.
fn parse_env<T: FromStr>(key: &str, raw: Option<&str>, slot: &mut T) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!("config: ignoring {key}={raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_overrides_only_valid_values() {
        let mut pin: PinId = 4;
        parse_env("DHT_GPIO", None, &mut pin);
        assert_eq!(pin, 4);
        parse_env("DHT_GPIO", Some(" 13 "), &mut pin);
        assert_eq!(pin, 13);
        parse_env("DHT_GPIO", Some("thirteen"), &mut pin);
        assert_eq!(pin, 13);
    }

    #[test]
    fn dht_kind_parses_from_its_name() {
        let mut kind = DhtKind::Dht22;
        parse_env("DHT_KIND", Some("dht11"), &mut kind);
        assert_eq!(kind, DhtKind::Dht11);
    }

    #[test]
    fn defaults_keep_test_pins_apart() {
        let cfg = AppConfig::default();
        assert_ne!(cfg.test_out_gpio, cfg.test_in_gpio);
        assert_ne!(cfg.dht_gpio, cfg.test_out_gpio);
        assert!(cfg.firmware_version().starts_with(APP_VERSION));
    }
}

use std::sync::Arc;

use anyhow::{anyhow, Result};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::server::EspHttpServer;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use log::{error, info};

use crate::bench::{BenchPins, TestBench};
use crate::config::AppConfig;
use crate::dio::{self, Dio};
use crate::esp::{self, EspPlatform};
use crate::http::{self, InfoPayload};
use crate::sensors::{Dht, Max6675};

pub struct Board {
    pub dio: &'static Dio,
    pub dht: Dht,
    pub max6675: Max6675,
    pub bench: TestBench,
    pub wifi: Option<BlockingWifi<EspWifi<'static>>>,
    pub http: Option<EspHttpServer<'static>>,
}

impl Board {
    pub fn init(cfg: &AppConfig) -> Result<Self> {
        let Peripherals { modem, .. } = Peripherals::take()?;

        let dio = dio::init(Arc::new(EspPlatform::new()?))?;
        let dht = Dht::new(dio, cfg.dht_gpio, cfg.dht_kind, cfg.dht_poll_ms, cfg.dht_buffer_len)?;
        let max6675 = Max6675::new(
            dio,
            cfg.max6675_cs_gpio,
            cfg.max6675_sck_gpio,
            cfg.max6675_so_gpio,
            cfg.max6675_poll_ms,
            cfg.max6675_buffer_len,
        )?;
        let bench = TestBench::new(
            dio.clone(),
            BenchPins {
                out: cfg.test_out_gpio,
                input: cfg.test_in_gpio,
                dht: cfg.dht_gpio,
            },
        )
        .with_dht(dht.clone());

        let wifi = match init_wifi(modem, cfg) {
            Ok(wifi) => Some(wifi),
            Err(err) => {
                error!("Wi-Fi unavailable: {err:?}");
                None
            }
        };
        let http = match &wifi {
            Some(_) => {
                let info = InfoPayload::new(cfg, esp::chip_id(), esp::sdk_version());
                Some(http::server::start(info, bench.clone())?)
            }
            None => None,
        };

        Ok(Self {
            dio,
            dht,
            max6675,
            bench,
            wifi,
            http,
        })
    }
}

fn init_wifi(modem: Modem, cfg: &AppConfig) -> Result<BlockingWifi<EspWifi<'static>>> {
    if cfg.wifi_ssid == "YOUR_WIFI_SSID" {
        return Err(anyhow!("WIFI_SSID not configured"));
    }
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;

    let auth_method = if cfg.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let ssid = cfg
        .wifi_ssid
        .as_str()
        .try_into()
        .map_err(|_| anyhow!("WIFI_SSID too long"))?;
    let password = cfg
        .wifi_pass
        .as_str()
        .try_into()
        .map_err(|_| anyhow!("WIFI_PASS too long"))?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid,
        password,
        auth_method,
        ..Default::default()
    }))?;
    ensure_connected(&mut wifi)?;

    let ip = wifi.wifi().sta_netif().get_ip_info()?;
    info!("Wi-Fi connected to {}, ip {}", cfg.wifi_ssid, ip.ip);
    Ok(wifi)
}

pub fn ensure_connected(wifi: &mut BlockingWifi<EspWifi<'static>>) -> Result<()> {
    if !wifi.is_started()? {
        wifi.start()?;
    }
    if !wifi.is_connected()? {
        wifi.connect()?;
    }
    wifi.wait_netif_up()?;
    Ok(())
}

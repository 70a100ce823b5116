// main.rs
// dio-seq firmware: DHT22 + MAX6675 polled through software-timed pulse
// sequences, plus a loopback test bench reachable over HTTP.
//
// Pin map (defaults, see config.rs):
// DHT22:    DATA=GPIO4
// MAX6675:  CS=GPIO7, SCK=GPIO10, SO=GPIO11
// Bench:    OUT=GPIO5 jumpered to IN=GPIO6
//
// HTTP:
//   GET  /api/info
//   POST /api/test   {"test_number": 1..12}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::time::Duration;

    use dio_seq::board::Board;
    use dio_seq::config::AppConfig;
    use esp_idf_svc::log::EspLogger;
    use log::info;

    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    let cfg = AppConfig::from_env();
    info!(
        "{} {} on {} starting",
        dio_seq::config::APP_NAME,
        cfg.firmware_version(),
        cfg.device_name
    );

    let board = Board::init(&cfg)?;

    loop {
        std::thread::sleep(Duration::from_secs(30));

        let temperature = board.dht.temperature(0);
        let humidity = board.dht.humidity(0);
        if temperature.invalid {
            info!("DHT: no valid reading");
        } else {
            info!("DHT: {:.1}°C {:.1}%", temperature.value, humidity.value);
        }
        let thermocouple = board.max6675.temperature(0);
        if thermocouple.invalid {
            info!("MAX6675: no valid reading");
        } else {
            info!("MAX6675: {:.2}°C", thermocouple.value);
        }
        info!("dio_task queue high water: {}", board.dio.queue().high_water());

        if let Some(wifi) = board.wifi.as_ref() {
            if !wifi.is_connected().unwrap_or(false) {
                info!("Wi-Fi link down");
            }
        }
    }
}

/// Host build: play test scenario 2 on the simulated board and print the
/// resulting pin trace.
#[cfg(all(not(target_os = "espidf"), feature = "sim"))]
fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use dio_seq::bench::{BenchPins, TestBench};
    use dio_seq::sim::SimBoard;
    use dio_seq::Dio;

    let board = SimBoard::new();
    let dio = Dio::new(Arc::new(board.clone()))?;
    let pins = BenchPins {
        out: 5,
        input: 6,
        dht: 4,
    };
    board.wire(pins.out, pins.input);
    let bench = TestBench::new(dio.clone(), pins);

    bench.run_test(2)?;
    board.advance_ms(30_000);
    dio.run_pending();

    for change in board.trace() {
        println!("{:>10} us  GPIO{}  {}", change.at_us, change.pin, change.level);
    }
    println!("{:?}", bench.reports());
    Ok(())
}

#[cfg(all(not(target_os = "espidf"), not(feature = "sim")))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("host builds need the `sim` feature: cargo run --features sim")
}

use std::fs;
use std::path::PathBuf;

fn main() {
    // Propagate ESP-IDF link/cfg/include args from esp-idf-sys (firmware builds only).
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "espidf" {
        if let Err(err) = embuild::build::LinkArgs::output_propagated("ESP_IDF") {
            println!("cargo:warning=esp-idf link args not propagated: {err}");
        }
        if let Err(err) = embuild::build::CfgArgs::output_propagated("ESP_IDF") {
            println!("cargo:warning=esp-idf cfg args not propagated: {err}");
        }
    }

    for key in [
        "APP_BUILD",
        "DEVICE_NAME",
        "WIFI_SSID",
        "WIFI_PASS",
        "DHT_GPIO",
        "DHT_KIND",
        "DHT_POLL_MS",
        "DHT_BUFFER_LEN",
        "MAX6675_CS_GPIO",
        "MAX6675_SCK_GPIO",
        "MAX6675_SO_GPIO",
        "MAX6675_POLL_MS",
        "MAX6675_BUFFER_LEN",
        "TEST_OUT_GPIO",
        "TEST_IN_GPIO",
    ] {
        println!("cargo:rerun-if-env-changed={key}");
    }

    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    let build_file = manifest_dir.join("scripts").join("build-number.txt");
    println!("cargo:rerun-if-changed={}", build_file.display());

    let mut build = std::env::var("APP_BUILD").ok().filter(|v| !v.trim().is_empty());
    if build.is_none() {
        if let Ok(contents) = fs::read_to_string(&build_file) {
            let candidate = contents.trim().to_string();
            if !candidate.is_empty() {
                build = Some(candidate);
            }
        }
    }

    if let Some(value) = build {
        println!("cargo:rustc-env=APP_BUILD={}", value);
    }
}

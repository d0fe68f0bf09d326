//! WiFi credential utility.
//!
//! Stores the credential the camera node tries first on boot, so a device
//! can skip SmartConfig provisioning.
//!
//! ESP32 (credentials baked in at compile time, written to NVS):
//!   WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo configure-wifi
//!
//! Host (credentials read at run time, written to the file store):
//!   WIFI_SSID="MyNetwork" WIFI_PASSWORD="secret" cargo run --bin configure-wifi
//!   cargo run --bin configure-wifi -- --clear
//!
//! For open networks leave WIFI_PASSWORD empty.

use camstream_esp32::config::{WifiCredential, MIN_WPA_PASSWORD_LEN};
use camstream_esp32::store::KvStore;
use camstream_esp32::wifi::save_credential;

/// WiFi SSID - set via WIFI_SSID environment variable at compile time.
#[cfg(feature = "esp32")]
const WIFI_SSID: Option<&str> = option_env!("WIFI_SSID");

/// WiFi password - set via WIFI_PASSWORD environment variable at compile time.
#[cfg(feature = "esp32")]
const WIFI_PASSWORD: Option<&str> = option_env!("WIFI_PASSWORD");

const USAGE: &str = "Usage:\n  \
    WIFI_SSID=\"MyNetwork\" WIFI_PASSWORD=\"secret\" cargo configure-wifi\n\n\
    For open networks:\n  \
    WIFI_SSID=\"OpenNetwork\" WIFI_PASSWORD=\"\" cargo configure-wifi";

/// Print error message and halt. On ESP32, we pause briefly then exit
/// so the serial monitor shows the output.
fn halt_with_error(msg: &str) -> ! {
    eprintln!("\n{}", msg);
    eprintln!("\n=== Configuration failed ===\n");
    std::thread::sleep(std::time::Duration::from_secs(2));
    std::process::exit(1);
}

/// Validate the pair, reporting problems the way a user can fix them.
fn build_credential(ssid: Option<&str>, password: &str) -> WifiCredential {
    let ssid = match ssid {
        Some(s) if !s.is_empty() => s,
        _ => halt_with_error(&format!("Error: WIFI_SSID not set.\n\n{}", USAGE)),
    };

    println!("SSID: {}", ssid);
    println!(
        "Password: {} ({} chars)",
        if password.is_empty() { "(none)" } else { "****" },
        password.len()
    );

    let credential = match WifiCredential::new(ssid, password) {
        Ok(credential) => credential,
        Err(e) => halt_with_error(&format!("Error: {}", e)),
    };
    let short_passphrase = password.len() < MIN_WPA_PASSWORD_LEN;
    if !credential.is_open() && !credential.is_wep_key() && short_passphrase {
        println!(
            "Warning: {} bytes is shorter than a WPA2 passphrase (min {})",
            password.len(),
            MIN_WPA_PASSWORD_LEN
        );
    }
    credential
}

fn store_credential(store: &mut dyn KvStore, credential: &WifiCredential) {
    match save_credential(store, credential) {
        Ok(()) => {
            println!("\n=== WiFi credential saved ===");
            println!("\nThe camera node will try it first on every boot.");
        }
        Err(e) => halt_with_error(&format!("Error saving credential: {}", e)),
    }
}

#[cfg(feature = "esp32")]
fn main() {
    use camstream_esp32::persistence::NvsStore;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    println!("\n=== WiFi Configuration Utility ===\n");

    let credential = build_credential(WIFI_SSID, WIFI_PASSWORD.unwrap_or(""));

    let partition = EspDefaultNvsPartition::take()
        .unwrap_or_else(|e| halt_with_error(&format!("Error initializing NVS: {:?}", e)));
    let mut store = NvsStore::new(partition)
        .unwrap_or_else(|e| halt_with_error(&format!("Error opening NVS: {}", e)));
    store_credential(&mut store, &credential);

    println!("\n=== Done - you can disconnect the device ===\n");
    std::thread::sleep(std::time::Duration::from_secs(2));
}

#[cfg(not(feature = "esp32"))]
fn main() {
    use camstream_esp32::config::AppConfig;
    use camstream_esp32::persistence_host::FileKvStore;
    use camstream_esp32::wifi::clear_credential;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()
        .unwrap_or_else(|e| halt_with_error(&format!("Bad configuration: {}", e)));
    let mut store = FileKvStore::open(&config.store_dir)
        .unwrap_or_else(|e| halt_with_error(&format!("Error opening store: {}", e)));

    if std::env::args().any(|arg| arg == "--clear") {
        match clear_credential(&mut store) {
            Ok(()) => println!("Stored credential removed; next boot provisions."),
            Err(e) => halt_with_error(&format!("Error clearing credential: {}", e)),
        }
        return;
    }

    let ssid = std::env::var("WIFI_SSID").ok();
    let password = std::env::var("WIFI_PASSWORD").unwrap_or_default();
    let credential = build_credential(ssid.as_deref(), &password);
    store_credential(&mut store, &credential);
}

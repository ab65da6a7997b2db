//! Module configuration, persisted as a JSON blob through an opaque store.
//!
//! The store is a single key-value blob: on the module it lives in flash,
//! on the host it is a plain file. Fixed settings are typed fields;
//! per-SSID Wi-Fi credentials and static IP assignments are keyed maps so
//! new networks can be added without schema changes.

use anyhow::{anyhow, Result};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// Backing store for the configuration blob.
pub trait BlobStore: Send {
    /// Load the blob, `None` when nothing has been saved yet.
    fn load_blob(&self) -> Result<Option<Vec<u8>>>;
    fn save_blob(&self, blob: &[u8]) -> Result<()>;
}

/// File-backed blob store used on the host.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlobStore for FileStore {
    fn load_blob(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_blob(&self, blob: &[u8]) -> Result<()> {
        std::fs::write(&self.path, blob)?;
        Ok(())
    }
}

// Global store handle - initialized once in main (or per test)
static STORE: Mutex<Option<Box<dyn BlobStore>>> = Mutex::new(None);

pub fn init_store(store: Box<dyn BlobStore>) {
    debug!("Initializing config store");
    *STORE.lock().unwrap() = Some(store);
    info!("Config store initialized");
}

/// Autostart configuration (`auto.*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoConfig {
    /// Start the cellular modem at boot.
    #[serde(default)]
    pub modem: bool,
    /// Wi-Fi mode at boot: off, client, ap or apclient.
    #[serde(default = "default_wifi_mode")]
    pub wifi_mode: String,
    /// SSID for client mode; empty means open roaming.
    #[serde(default)]
    pub wifi_ssid_client: String,
    /// SSID for AP mode.
    #[serde(default)]
    pub wifi_ssid_ap: String,
    /// Vehicle decoder to load at boot.
    #[serde(default)]
    pub vehicle_type: String,
}

fn default_wifi_mode() -> String {
    "off".to_string()
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            modem: false,
            wifi_mode: default_wifi_mode(),
            wifi_ssid_client: String::new(),
            wifi_ssid_ap: String::new(),
            vehicle_type: String::new(),
        }
    }
}

/// Network tuning (`network.*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Minimum active scan dwell per channel (ms).
    #[serde(default = "default_scan_tmin")]
    pub wifi_scan_tmin: u32,
    /// Maximum active scan dwell per channel (ms).
    #[serde(default = "default_scan_tmax")]
    pub wifi_scan_tmax: u32,
    /// RSSI above which the signal counts as good again (dBm).
    #[serde(default = "default_sq_good")]
    pub wifi_sq_good: f32,
    /// RSSI below which the signal counts as bad (dBm).
    #[serde(default = "default_sq_bad")]
    pub wifi_sq_bad: f32,
}

const fn default_scan_tmin() -> u32 {
    120
}

const fn default_scan_tmax() -> u32 {
    120
}

const fn default_sq_good() -> f32 {
    -87.0
}

const fn default_sq_bad() -> f32 {
    -89.0
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_scan_tmin: default_scan_tmin(),
            wifi_scan_tmax: default_scan_tmax(),
            wifi_sq_good: default_sq_good(),
            wifi_sq_bad: default_sq_bad(),
        }
    }
}

/// Cellular modem configuration (`modem.*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Serial endpoint, e.g. `tcp:127.0.0.1:35600`.
    #[serde(default)]
    pub endpoint: String,
    /// Start GPS/NMEA once the mux is up.
    #[serde(default = "default_true")]
    pub enable_gps: bool,
    /// APN for the data connection.
    #[serde(default = "default_apn")]
    pub apn: String,
}

const fn default_true() -> bool {
    true
}

fn default_apn() -> String {
    "internet".to_string()
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            enable_gps: default_true(),
            apn: default_apn(),
        }
    }
}

/// OBD-II poller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Maximum queries sent per scheduler tick.
    #[serde(default = "default_throttling")]
    pub throttling: u16,
    /// Response separation time between polls (ms), also sent in ISO-TP
    /// flow control frames.
    #[serde(default = "default_separation_ms")]
    pub separation_time_ms: u8,
    /// CAN endpoint, e.g. `tcp:127.0.0.1:35700`.
    #[serde(default)]
    pub can_endpoint: String,
}

const fn default_throttling() -> u16 {
    50
}

const fn default_separation_ms() -> u8 {
    5
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            throttling: default_throttling(),
            separation_time_ms: default_separation_ms(),
            can_endpoint: String::new(),
        }
    }
}

/// Static IP assignment for one SSID, parsed from the stored
/// `ip,netmask,gateway` string. The gateway doubles as the DNS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl StaticIpConfig {
    /// Parse `"<ip>,<netmask>,<gateway>"`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split(',');
        let ip = parts
            .next()
            .ok_or_else(|| anyhow!("missing ip"))?
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid ip in {value:?}"))?;
        let netmask = parts
            .next()
            .ok_or_else(|| anyhow!("missing netmask"))?
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid netmask in {value:?}"))?;
        let gateway = parts
            .next()
            .ok_or_else(|| anyhow!("missing gateway"))?
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid gateway in {value:?}"))?;
        Ok(Self {
            ip,
            netmask,
            gateway,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auto: AutoConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    /// Known station networks: SSID -> password.
    #[serde(default)]
    pub wifi_ssid: BTreeMap<String, String>,
    /// Static IP per SSID: SSID -> "ip,netmask,gateway".
    #[serde(default)]
    pub wifi_staticip: BTreeMap<String, String>,
    /// Access point credentials: SSID -> password.
    #[serde(default)]
    pub wifi_ap: BTreeMap<String, String>,
    /// Module admin password, AP password fallback.
    #[serde(default)]
    pub module_password: String,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Config {
    /// Password for a known station SSID.
    #[must_use]
    pub fn wifi_password(&self, ssid: &str) -> Option<&str> {
        self.wifi_ssid.get(ssid).map(String::as_str).filter(|p| !p.is_empty())
    }

    /// Static IP assignment for an SSID, if configured and well-formed.
    #[must_use]
    pub fn static_ip(&self, ssid: &str) -> Option<StaticIpConfig> {
        let raw = self.wifi_staticip.get(ssid)?;
        match StaticIpConfig::parse(raw) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("Bad static IP config for {ssid}: {e}");
                None
            }
        }
    }

    /// Access point password for an SSID, falling back to the module
    /// password like the access point autostart does.
    #[must_use]
    pub fn ap_password(&self, ssid: &str) -> Option<&str> {
        self.wifi_ap
            .get(ssid)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .or_else(|| {
                if self.module_password.is_empty() {
                    None
                } else {
                    warn!("Using module password as AP password");
                    Some(self.module_password.as_str())
                }
            })
    }

    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.network.wifi_scan_tmax < self.network.wifi_scan_tmin {
            warn!(
                "Scan dwell tmax {} < tmin {}, swapping",
                self.network.wifi_scan_tmax, self.network.wifi_scan_tmin
            );
            std::mem::swap(
                &mut self.network.wifi_scan_tmin,
                &mut self.network.wifi_scan_tmax,
            );
        }
        if self.network.wifi_sq_good <= self.network.wifi_sq_bad {
            warn!("Signal thresholds not hysteretic, resetting to defaults");
            self.network.wifi_sq_good = default_sq_good();
            self.network.wifi_sq_bad = default_sq_bad();
        }
        if self.poller.throttling == 0 {
            warn!("Poller throttling 0 would stall polling, resetting");
            self.poller.throttling = default_throttling();
        }
        match self.auto.wifi_mode.as_str() {
            "off" | "client" | "ap" | "apclient" => {}
            other => {
                warn!("Unknown auto wifi mode {other:?}, using off");
                self.auto.wifi_mode = "off".to_string();
            }
        }
    }

    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(mut config) => {
                info!("Loaded config from store");
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config: {e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn load() -> Result<Self> {
        debug!("Loading config from store");
        let store_guard = STORE.lock().unwrap();
        let store = store_guard
            .as_ref()
            .ok_or_else(|| anyhow!("Config store not initialized"))?;
        let blob = store
            .load_blob()?
            .ok_or_else(|| anyhow!("No config found in store"))?;
        debug!("Config blob size: {} bytes", blob.len());
        let config: Config = serde_json::from_slice(&blob)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        debug!("Saving config to store");
        let store_guard = STORE.lock().unwrap();
        let store = store_guard
            .as_ref()
            .ok_or_else(|| anyhow!("Config store not initialized"))?;
        let json = serde_json::to_vec_pretty(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        store.save_blob(&json)?;
        info!("Config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_ip_parses() {
        let cfg = StaticIpConfig::parse("192.168.12.34,255.255.255.0,192.168.12.1").unwrap();
        assert_eq!(cfg.ip, Ipv4Addr::new(192, 168, 12, 34));
        assert_eq!(cfg.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(cfg.gateway, Ipv4Addr::new(192, 168, 12, 1));

        assert!(StaticIpConfig::parse("192.168.12.34").is_err());
        assert!(StaticIpConfig::parse("bogus,255.255.255.0,192.168.12.1").is_err());
    }

    #[test]
    fn ap_password_fallback() {
        let mut config = Config::default();
        config
            .wifi_ap
            .insert("OVMS".to_string(), "apsecret".to_string());
        assert_eq!(config.ap_password("OVMS"), Some("apsecret"));
        assert_eq!(config.ap_password("Other"), None);

        config.module_password = "modpw".to_string();
        assert_eq!(config.ap_password("Other"), Some("modpw"));
    }

    #[test]
    fn validate_fixes_thresholds() {
        let mut config = Config::default();
        config.network.wifi_sq_good = -95.0;
        config.network.wifi_sq_bad = -80.0;
        config.validate();
        assert!(config.network.wifi_sq_good > config.network.wifi_sq_bad);
    }

    #[test]
    fn json_roundtrip() {
        let mut config = Config::default();
        config
            .wifi_ssid
            .insert("home".to_string(), "secret".to_string());
        config.wifi_staticip.insert(
            "home".to_string(),
            "192.168.12.34,255.255.255.0,192.168.12.1".to_string(),
        );
        config.auto.modem = true;

        let json = serde_json::to_vec(&config).unwrap();
        let parsed: Config = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.wifi_password("home"), Some("secret"));
        assert!(parsed.static_ip("home").is_some());
        assert!(parsed.auto.modem);
    }
}

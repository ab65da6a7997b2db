//! Wi-Fi station/AP controller.
//!
//! The vendor driver is a collaborator behind [`WifiDriver`] and
//! [`NetifControl`]; configuration vocabulary comes from `embedded-svc`.
//! Association does not trust the driver's AP selection: every connect
//! starts with an explicit scan, then binds to a specific BSSID (the
//! driver blob round-robins between same-SSID APs on first call instead
//! of picking the strongest).
//!
//! A 1 Hz tick polls connection state, smooths RSSI and drives the
//! reconnect timer; a disconnect arms a rescan 10 seconds out.

use anyhow::{anyhow, bail, Result};
use embedded_svc::wifi::{
    AccessPointConfiguration, AccessPointInfo, AuthMethod, ClientConfiguration, Configuration,
};
#[cfg(test)]
use embedded_svc::wifi::SecondaryChannel;
use log::{debug, info, warn};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::events::EventBus;
use crate::metrics::{standard, Metric, Metrics, Unit, STALE_MID};
use crate::monotonic_secs;
use crate::thread_util;
use crate::watchdog::WatchdogHandle;

/// Seconds between a disconnect and the next scan-and-connect attempt.
const RECONNECT_DELAY_SECS: u64 = 10;

/// RSSI placeholder while not associated, in dBm x10.
const RSSI_NONE: i32 = -1270;

/// Minimum WPA2 passphrase length for our own AP.
const AP_PASSWORD_MIN: usize = 8;

/// The vendor Wi-Fi driver surface this controller needs.
pub trait WifiDriver: Send {
    fn set_configuration(&mut self, conf: &Configuration) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
    /// Active scan, hidden SSIDs included. `min`/`max` bound the dwell per
    /// channel: at least `min`, extended up to `max` while beacons keep
    /// arriving.
    fn scan(&mut self, min: Duration, max: Duration) -> Result<Vec<AccessPointInfo>>;
    /// Current RSSI of the associated AP, in dBm.
    fn sta_rssi(&self) -> Option<i8>;
    /// Station IP once assigned.
    fn sta_ip(&self) -> Option<Ipv4Addr>;
}

/// Network interface controls next to the driver.
pub trait NetifControl: Send {
    fn start_dhcp_client(&mut self) -> Result<()>;
    /// Stop DHCP and assign a fixed address; `dns` is handed to the
    /// resolver as the main server.
    fn set_static_ip(
        &mut self,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Result<()>;
    /// Configure what the AP's DHCP server offers to clients.
    fn configure_ap_dhcp(&mut self, offer_dns: bool, offer_router: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Off,
    Client,
    AccessPoint,
    ApClient,
    Scan,
}

struct StaState {
    ssid: String,
    password: String,
    bssid: Option<[u8; 6]>,
    connected: bool,
    has_ip: bool,
    /// Monotonic second of the next scan-and-connect attempt.
    reconnect_at: Option<u64>,
    /// Smoothed RSSI in dBm x10.
    rssi_x10: i32,
    good_signal: bool,
}

impl StaState {
    fn new() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            bssid: None,
            connected: false,
            has_ip: false,
            reconnect_at: None,
            rssi_x10: RSSI_NONE,
            good_signal: false,
        }
    }
}

pub struct WifiController {
    driver: Mutex<Box<dyn WifiDriver>>,
    netif: Mutex<Box<dyn NetifControl>>,
    mode: Mutex<WifiMode>,
    sta: Mutex<StaState>,
    ap_ssid: Mutex<String>,

    m_network: Arc<Metric>,
    m_sq: Arc<Metric>,
    /// Overall network signal quality, shared with the other bearers.
    m_net_sq: Arc<Metric>,

    config: Arc<Mutex<Config>>,
    events: Arc<EventBus>,
}

impl WifiController {
    pub fn new(
        driver: Box<dyn WifiDriver>,
        netif: Box<dyn NetifControl>,
        config: Arc<Mutex<Config>>,
        metrics: &Metrics,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver: Mutex::new(driver),
            netif: Mutex::new(netif),
            mode: Mutex::new(WifiMode::Off),
            sta: Mutex::new(StaState::new()),
            ap_ssid: Mutex::new(String::new()),
            m_network: metrics.init_string(standard::NET_WIFI_NETWORK, 0),
            m_sq: metrics.init_float(standard::NET_WIFI_SQ, STALE_MID, Unit::Dbm),
            m_net_sq: metrics.init_float(standard::NET_SQ, STALE_MID, Unit::Dbm),
            config,
            events,
        })
    }

    /// Spawn the 1 Hz management task.
    pub fn start_task(self: &Arc<Self>) {
        let controller = self.clone();
        thread_util::spawn_named("wifi_mgr", move || {
            let watchdog = WatchdogHandle::register("wifi_mgr");
            loop {
                watchdog.feed();
                controller.tick();
                std::thread::sleep(Duration::from_secs(1));
            }
        });
    }

    /// Apply the `auto.wifi.mode` boot configuration.
    pub fn auto_init(self: &Arc<Self>) {
        let (mode, client_ssid, ap_ssid) = {
            let config = self.config.lock().unwrap();
            (
                config.auto.wifi_mode.clone(),
                config.auto.wifi_ssid_client.clone(),
                config.auto.wifi_ssid_ap.clone(),
            )
        };
        let result = match mode.as_str() {
            "client" => self.start_client(&client_ssid, None),
            "ap" => self.start_access_point(&ap_ssid),
            "apclient" => self.start_ap_client(&ap_ssid, &client_ssid, None),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Wifi auto init ({mode}) inhibited: {e}");
        }
    }

    #[must_use]
    pub fn mode(&self) -> WifiMode {
        *self.mode.lock().unwrap()
    }

    /// Start client mode. Empty `ssid` means open roaming across all
    /// configured networks; otherwise the password must be configured.
    pub fn start_client(&self, ssid: &str, bssid: Option<[u8; 6]>) -> Result<()> {
        let password = if ssid.is_empty() {
            String::new()
        } else {
            self.config
                .lock()
                .unwrap()
                .wifi_password(ssid)
                .map(ToString::to_string)
                .ok_or_else(|| anyhow!("no password configured for SSID {ssid}"))?
        };

        info!(
            "Starting Wifi client mode (ssid {})",
            if ssid.is_empty() { "<any>" } else { ssid }
        );
        {
            let mut driver = self.driver.lock().unwrap();
            driver.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
            driver.start()?;
        }

        *self.mode.lock().unwrap() = WifiMode::Client;
        let mut sta = self.sta.lock().unwrap();
        sta.ssid = ssid.to_string();
        sta.password = password;
        sta.bssid = bssid;
        sta.connected = false;
        sta.has_ip = false;
        sta.reconnect_at = Some(monotonic_secs());
        Ok(())
    }

    /// Start AP mode. The password comes from configuration and must meet
    /// the WPA2 minimum length.
    pub fn start_access_point(&self, ssid: &str) -> Result<()> {
        if ssid.is_empty() {
            bail!("AP SSID not configured");
        }
        let password = self
            .config
            .lock()
            .unwrap()
            .ap_password(ssid)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("no AP password set, AP mode inhibited"))?;
        if password.len() < AP_PASSWORD_MIN {
            bail!("AP password must be at least {AP_PASSWORD_MIN} characters");
        }

        info!("Starting Wifi access point (ssid {ssid})");
        {
            let mut driver = self.driver.lock().unwrap();
            driver.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid.try_into().unwrap_or_default(),
                password: password.as_str().try_into().unwrap_or_default(),
                auth_method: AuthMethod::WPA2Personal,
                max_connections: 4,
                ..Default::default()
            }))?;
            driver.start()?;
        }
        // never offer ourselves as DNS or default route to AP clients
        self.netif.lock().unwrap().configure_ap_dhcp(false, false)?;

        *self.mode.lock().unwrap() = WifiMode::AccessPoint;
        *self.ap_ssid.lock().unwrap() = ssid.to_string();
        self.events.signal("system.wifi.ap.start");
        Ok(())
    }

    /// Combined AP + client operation.
    pub fn start_ap_client(
        &self,
        ap_ssid: &str,
        sta_ssid: &str,
        sta_bssid: Option<[u8; 6]>,
    ) -> Result<()> {
        self.start_access_point(ap_ssid)?;
        self.start_client(sta_ssid, sta_bssid)?;
        *self.mode.lock().unwrap() = WifiMode::ApClient;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        info!("Stopping Wifi");
        {
            let mut driver = self.driver.lock().unwrap();
            driver.disconnect().ok();
            driver.stop()?;
        }
        let was_ap = matches!(self.mode(), WifiMode::AccessPoint | WifiMode::ApClient);
        *self.mode.lock().unwrap() = WifiMode::Off;
        let mut sta = self.sta.lock().unwrap();
        sta.connected = false;
        sta.has_ip = false;
        sta.reconnect_at = None;
        sta.rssi_x10 = RSSI_NONE;
        drop(sta);
        self.m_network.set_string("");
        if was_ap {
            self.events.signal("system.wifi.ap.stop");
        }
        Ok(())
    }

    /// Force a fresh scan-and-connect cycle.
    pub fn reconnect(&self, out: &mut dyn Write) -> i32 {
        if !matches!(self.mode(), WifiMode::Client | WifiMode::ApClient) {
            let _ = writeln!(out, "ERROR: wifi not in client or apclient mode");
            return 1;
        }
        let _ = writeln!(out, "Starting Wifi client reconnect.");
        let connected = self.sta.lock().unwrap().connected;
        if connected {
            if let Err(e) = self.driver.lock().unwrap().disconnect() {
                let _ = writeln!(out, "ERROR: Wifi disconnect failed: {e}");
                return 1;
            }
        }
        self.sta.lock().unwrap().reconnect_at = Some(monotonic_secs());
        0
    }

    /// One management tick: state edges, RSSI smoothing, reconnect timer.
    pub fn tick(&self) {
        let mode = self.mode();
        if mode == WifiMode::Off {
            return;
        }

        let (connected, ip, rssi) = {
            let driver = self.driver.lock().unwrap();
            (driver.is_connected(), driver.sta_ip(), driver.sta_rssi())
        };

        let mut connect_now = false;
        {
            let mut sta = self.sta.lock().unwrap();

            if connected && !sta.connected {
                sta.connected = true;
                info!("Wifi STA connected to '{}'", sta.ssid);
                self.m_network.set_string(&sta.ssid);
                self.events.signal("system.wifi.sta.connected");
                self.apply_ip_config(&sta.ssid);
            } else if !connected && sta.connected {
                sta.connected = false;
                sta.has_ip = false;
                sta.rssi_x10 = RSSI_NONE;
                warn!("Wifi STA disconnected from '{}'", sta.ssid);
                self.m_network.set_string("");
                self.events.signal("system.wifi.sta.disconnected");
                sta.reconnect_at = Some(monotonic_secs() + RECONNECT_DELAY_SECS);
            }

            let has_ip = connected && ip.is_some();
            if has_ip && !sta.has_ip {
                sta.has_ip = true;
                info!("Wifi STA got IP {}", ip.unwrap());
                self.events.signal("system.wifi.sta.gotip");
            } else if !has_ip && sta.has_ip {
                sta.has_ip = false;
                self.events.signal("system.wifi.sta.lostip");
            }

            if sta.connected {
                if let Some(sample) = rssi {
                    let (good_dbm, bad_dbm) = {
                        let config = self.config.lock().unwrap();
                        (config.network.wifi_sq_good, config.network.wifi_sq_bad)
                    };
                    apply_rssi_sample(&mut sta, sample, good_dbm, bad_dbm);
                    let dbm = sta.rssi_x10 as f32 / 10.0;
                    self.m_sq.set_float(dbm);
                    self.m_net_sq.set_float(dbm);
                }
            }

            if matches!(mode, WifiMode::Client | WifiMode::ApClient)
                && !sta.connected
                && sta.reconnect_at.is_some_and(|at| monotonic_secs() >= at)
            {
                connect_now = true;
            }
        }

        if connect_now {
            self.start_connect();
        }
    }

    /// Scan, pick the best usable AP and connect to it by BSSID.
    fn start_connect(&self) {
        let (dwell_min, dwell_max) = self.scan_dwell();

        let scan_result = self.driver.lock().unwrap().scan(dwell_min, dwell_max);
        self.events.signal("system.wifi.scan.done");
        let list = match scan_result {
            Ok(list) => list,
            Err(e) => {
                warn!("Connect scan failed: {e}");
                self.sta.lock().unwrap().reconnect_at =
                    Some(monotonic_secs() + RECONNECT_DELAY_SECS);
                return;
            }
        };

        let (sta_ssid, sta_password, sta_bssid) = {
            let sta = self.sta.lock().unwrap();
            (sta.ssid.clone(), sta.password.clone(), sta.bssid)
        };
        let selection = {
            let config = self.config.lock().unwrap();
            select_ap(&list, &sta_ssid, &sta_password, sta_bssid, &config)
        };

        // next regular scan in 10 seconds
        self.sta.lock().unwrap().reconnect_at = Some(monotonic_secs() + RECONNECT_DELAY_SECS);

        let Some(selection) = selection else {
            debug!("Connect scan: no known SSID found");
            return;
        };

        info!(
            "Connecting to ssid='{}' bssid={} chan={} rssi={}",
            selection.ssid,
            format_bssid(selection.bssid),
            selection.channel,
            selection.rssi
        );
        {
            let mut sta = self.sta.lock().unwrap();
            sta.ssid.clone_from(&selection.ssid);
            sta.password.clone_from(&selection.password);
        }

        let mut driver = self.driver.lock().unwrap();
        let conf = Configuration::Client(ClientConfiguration {
            ssid: selection.ssid.as_str().try_into().unwrap_or_default(),
            password: selection.password.as_str().try_into().unwrap_or_default(),
            bssid: Some(selection.bssid),
            channel: Some(selection.channel),
            ..Default::default()
        });
        if let Err(e) = driver.set_configuration(&conf) {
            warn!("Connect configuration failed: {e}");
            return;
        }
        if let Err(e) = driver.connect() {
            warn!("Connect failed: {e}");
        }
    }

    /// Static IP or DHCP, according to the per-SSID configuration.
    fn apply_ip_config(&self, ssid: &str) {
        let static_ip = self.config.lock().unwrap().static_ip(ssid);
        let mut netif = self.netif.lock().unwrap();
        let result = match static_ip {
            Some(assign) => {
                info!(
                    "STA config ip: {}, netmask: {}, gateway: {}",
                    assign.ip, assign.netmask, assign.gateway
                );
                netif.set_static_ip(assign.ip, assign.netmask, assign.gateway, assign.gateway)
            }
            None => netif.start_dhcp_client(),
        };
        if let Err(e) = result {
            warn!("IP configuration failed: {e}");
        }
    }

    /// `wifi ip static [ip netmask gateway]` / `wifi ip dhcp`.
    pub fn command_ip(&self, args: &[&str], out: &mut dyn Write) -> i32 {
        let ssid = self.sta.lock().unwrap().ssid.clone();
        match args {
            ["dhcp"] => {
                self.config.lock().unwrap().wifi_staticip.remove(&ssid);
                match self.netif.lock().unwrap().start_dhcp_client() {
                    Ok(()) => {
                        let _ = writeln!(out, "DHCP client started");
                        0
                    }
                    Err(e) => {
                        let _ = writeln!(out, "ERROR: {e}");
                        1
                    }
                }
            }
            ["static"] => {
                self.apply_ip_config(&ssid);
                0
            }
            ["static", ip, netmask, gateway] => {
                let assignment = format!("{ip},{netmask},{gateway}");
                if let Err(e) = crate::config::StaticIpConfig::parse(&assignment) {
                    let _ = writeln!(out, "ERROR: {e}");
                    return 1;
                }
                self.config
                    .lock()
                    .unwrap()
                    .wifi_staticip
                    .insert(ssid.clone(), assignment);
                self.apply_ip_config(&ssid);
                0
            }
            _ => {
                let _ = writeln!(out, "Usage: wifi ip static|dhcp [ip netmask gateway]");
                1
            }
        }
    }

    /// Configured active scan dwell bounds, in milliseconds.
    fn scan_dwell(&self) -> (Duration, Duration) {
        let config = self.config.lock().unwrap();
        (
            Duration::from_millis(u64::from(config.network.wifi_scan_tmin)),
            Duration::from_millis(u64::from(config.network.wifi_scan_tmax)),
        )
    }

    /// Scan and print the result table, plain or JSON.
    pub fn scan_command(&self, out: &mut dyn Write, json: bool) -> i32 {
        let (dwell_min, dwell_max) = self.scan_dwell();
        if !json {
            let _ = writeln!(out, "Scanning for WIFI Access Points...");
        }
        let list = match self.driver.lock().unwrap().scan(dwell_min, dwell_max) {
            Ok(list) => list,
            Err(e) => {
                if json {
                    let _ = write!(out, "{{\"error\":{}}}", serde_json::json!(e.to_string()));
                } else {
                    let _ = writeln!(out, "ERROR: can't start scan: {e}");
                }
                return 1;
            }
        };

        if json {
            let entries: Vec<serde_json::Value> = list
                .iter()
                .map(|ap| {
                    serde_json::json!({
                        "ssid": display_ssid(ap),
                        "bssid": format_bssid(ap.bssid),
                        "chan": ap.channel,
                        "rssi": ap.signal_strength,
                        "auth": auth_label(ap.auth_method),
                    })
                })
                .collect();
            let _ = writeln!(out, "{}", serde_json::json!({ "list": entries }));
        } else {
            let _ = writeln!(
                out,
                "\n{:<32} {:<17} {:>4} {:>4} {:<22}",
                "AP SSID", "MAC ADDRESS", "CHAN", "RSSI", "AUTHENTICATION"
            );
            for ap in &list {
                let _ = writeln!(
                    out,
                    "{:<32} {} {:>4} {:>4} {}",
                    display_ssid(ap),
                    format_bssid(ap.bssid),
                    ap.channel,
                    ap.signal_strength,
                    auth_label(ap.auth_method)
                );
            }
            let _ = writeln!(out, "Scan complete: {} access point(s) found", list.len());
        }
        0
    }

    pub fn status(&self, out: &mut dyn Write) -> i32 {
        let mode = self.mode();
        let sta = self.sta.lock().unwrap();
        let _ = writeln!(out, "Mode:      {mode:?}");
        if matches!(mode, WifiMode::AccessPoint | WifiMode::ApClient) {
            let _ = writeln!(out, "AP SSID:   {}", self.ap_ssid.lock().unwrap());
        }
        if matches!(mode, WifiMode::Client | WifiMode::ApClient) {
            let _ = writeln!(
                out,
                "STA:       {} ({})",
                if sta.ssid.is_empty() { "<any>" } else { &sta.ssid },
                if sta.connected {
                    if sta.has_ip {
                        "connected"
                    } else {
                        "associated, waiting for IP"
                    }
                } else {
                    "disconnected"
                }
            );
            if sta.connected {
                let _ = writeln!(
                    out,
                    "Signal:    {:.1} dBm ({})",
                    sta.rssi_x10 as f32 / 10.0,
                    if sta.good_signal { "good" } else { "bad" }
                );
            }
        }
        0
    }
}

/// One selected scan entry plus the credentials to use for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub ssid: String,
    pub password: String,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi: i8,
}

/// The scan-and-bind selection rule:
/// 1. fixed BSSID: only that AP qualifies;
/// 2. fixed SSID: strongest entry with a matching (or hidden) SSID;
/// 3. roaming: strongest entry whose SSID has a configured password.
///
/// Ties break on first-seen scan order.
#[must_use]
pub fn select_ap(
    scan: &[AccessPointInfo],
    sta_ssid: &str,
    sta_password: &str,
    sta_bssid: Option<[u8; 6]>,
    config: &Config,
) -> Option<Selection> {
    let mut order: Vec<usize> = (0..scan.len()).collect();
    order.sort_by_key(|&k| std::cmp::Reverse(scan[k].signal_strength));

    for k in order {
        let ap = &scan[k];
        let ap_ssid = ap.ssid.as_str();
        if let Some(bssid) = sta_bssid {
            if ap.bssid != bssid {
                continue;
            }
        } else if !sta_ssid.is_empty() {
            // hidden entries report a blank SSID; assume they match
            if !ap_ssid.is_empty() && ap_ssid != sta_ssid {
                continue;
            }
        } else {
            let Some(password) = config.wifi_password(ap_ssid) else {
                continue;
            };
            return Some(Selection {
                ssid: ap_ssid.to_string(),
                password: password.to_string(),
                bssid: ap.bssid,
                channel: ap.channel,
                rssi: ap.signal_strength,
            });
        }
        return Some(Selection {
            ssid: if ap_ssid.is_empty() {
                sta_ssid.to_string()
            } else {
                ap_ssid.to_string()
            },
            password: sta_password.to_string(),
            bssid: ap.bssid,
            channel: ap.channel,
            rssi: ap.signal_strength,
        });
    }
    None
}

/// Fold one RSSI sample (dBm) into the smoothed dBm x10 value and update
/// the hysteretic good-signal flag.
fn apply_rssi_sample(sta: &mut StaState, sample: i8, good_dbm: f32, bad_dbm: f32) {
    let new = i32::from(sample) * 10;
    if sta.rssi_x10 <= RSSI_NONE {
        sta.rssi_x10 = new;
    } else {
        sta.rssi_x10 = (sta.rssi_x10 * 3 + new) / 4;
    }
    let dbm = sta.rssi_x10 as f32 / 10.0;
    if sta.good_signal && dbm < bad_dbm {
        sta.good_signal = false;
    } else if !sta.good_signal && dbm > good_dbm {
        sta.good_signal = true;
    }
}

#[must_use]
pub fn format_bssid(bssid: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bssid[0], bssid[1], bssid[2], bssid[3], bssid[4], bssid[5]
    )
}

/// Parse `aa:bb:cc:dd:ee:ff` into bytes.
#[must_use]
pub fn parse_bssid(text: &str) -> Option<[u8; 6]> {
    let mut bssid = [0u8; 6];
    let mut parts = text.split(':');
    for slot in &mut bssid {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bssid)
}

fn display_ssid(ap: &AccessPointInfo) -> String {
    if ap.ssid.is_empty() {
        "<HIDDEN>".to_string()
    } else {
        ap.ssid.to_string()
    }
}

fn auth_label(auth: Option<AuthMethod>) -> &'static str {
    match auth {
        None => "Unknown",
        Some(AuthMethod::None) => "OPEN",
        Some(AuthMethod::WEP) => "WEP",
        Some(AuthMethod::WPA) => "WPA_PSK",
        Some(AuthMethod::WPA2Personal) => "WPA2_PSK",
        Some(AuthMethod::WPAWPA2Personal) => "WPA_WPA2_PSK",
        Some(AuthMethod::WPA3Personal) => "WPA3_PSK",
        Some(AuthMethod::WPA2WPA3Personal) => "WPA2_WPA3_PSK",
        Some(_) => "Unknown",
    }
}

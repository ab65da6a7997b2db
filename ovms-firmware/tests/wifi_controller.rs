//! Wi-Fi controller scenarios against a mock driver and netif.

use embedded_svc::wifi::{
    AccessPointInfo, AuthMethod, ClientConfiguration, Configuration, SecondaryChannel,
};
use ovms_firmware::config::Config;
use ovms_firmware::events::EventBus;
use ovms_firmware::metrics::{register_standard, standard, Metrics};
use ovms_firmware::wifi::{NetifControl, WifiController, WifiDriver, WifiMode};
use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct DriverState {
    scan_results: Vec<AccessPointInfo>,
    started: bool,
    connected: bool,
    ip: Option<Ipv4Addr>,
    rssi: Option<i8>,
    last_client_config: Option<ClientConfiguration>,
    connect_calls: u32,
    scan_calls: u32,
    last_dwell: Option<(Duration, Duration)>,
}

struct MockDriver(Arc<Mutex<DriverState>>);

impl WifiDriver for MockDriver {
    fn set_configuration(&mut self, conf: &Configuration) -> anyhow::Result<()> {
        if let Configuration::Client(client) = conf {
            if client.bssid.is_some() {
                self.0.lock().unwrap().last_client_config = Some(client.clone());
            }
        }
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().started = false;
        Ok(())
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.lock().unwrap();
        state.connect_calls += 1;
        // association succeeds immediately in the mock
        state.connected = true;
        state.ip = Some(Ipv4Addr::new(192, 168, 12, 34));
        state.rssi = Some(-55);
        Ok(())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        let mut state = self.0.lock().unwrap();
        state.connected = false;
        state.ip = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    fn scan(&mut self, min: Duration, max: Duration) -> anyhow::Result<Vec<AccessPointInfo>> {
        let mut state = self.0.lock().unwrap();
        state.scan_calls += 1;
        state.last_dwell = Some((min, max));
        Ok(state.scan_results.clone())
    }

    fn sta_rssi(&self) -> Option<i8> {
        self.0.lock().unwrap().rssi
    }

    fn sta_ip(&self) -> Option<Ipv4Addr> {
        self.0.lock().unwrap().ip
    }
}

#[derive(Default)]
struct NetifCalls {
    dhcp_started: u32,
    static_set: Option<(Ipv4Addr, Ipv4Addr, Ipv4Addr, Ipv4Addr)>,
    ap_dhcp: Option<(bool, bool)>,
}

struct MockNetif(Arc<Mutex<NetifCalls>>);

impl NetifControl for MockNetif {
    fn start_dhcp_client(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().dhcp_started += 1;
        Ok(())
    }

    fn set_static_ip(
        &mut self,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> anyhow::Result<()> {
        self.0.lock().unwrap().static_set = Some((ip, netmask, gateway, dns));
        Ok(())
    }

    fn configure_ap_dhcp(&mut self, offer_dns: bool, offer_router: bool) -> anyhow::Result<()> {
        self.0.lock().unwrap().ap_dhcp = Some((offer_dns, offer_router));
        Ok(())
    }
}

fn ap(ssid: &str, last_octet: u8, rssi: i8) -> AccessPointInfo {
    AccessPointInfo {
        ssid: ssid.try_into().unwrap_or_default(),
        bssid: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last_octet],
        channel: 6,
        secondary_channel: SecondaryChannel::None,
        signal_strength: rssi,
        protocols: Default::default(),
        auth_method: Some(AuthMethod::WPA2Personal),
    }
}

struct Harness {
    controller: Arc<WifiController>,
    driver: Arc<Mutex<DriverState>>,
    netif: Arc<Mutex<NetifCalls>>,
    metrics: Arc<Metrics>,
    events: Arc<EventBus>,
}

fn start_harness(config: Config) -> Harness {
    let driver = Arc::new(Mutex::new(DriverState {
        scan_results: vec![
            ap("home", 0x01, -70),
            ap("home", 0x02, -55),
            ap("guest", 0x03, -40),
        ],
        ..Default::default()
    }));
    let netif = Arc::new(Mutex::new(NetifCalls::default()));
    let metrics = Metrics::new();
    register_standard(&metrics);
    let events = EventBus::new();
    let controller = WifiController::new(
        Box::new(MockDriver(driver.clone())),
        Box::new(MockNetif(netif.clone())),
        Arc::new(Mutex::new(config)),
        &metrics,
        events.clone(),
    );
    Harness {
        controller,
        driver,
        netif,
        metrics,
        events,
    }
}

fn home_config() -> Config {
    let mut config = Config::default();
    config
        .wifi_ssid
        .insert("home".to_string(), "secret".to_string());
    config
}

#[test]
fn associates_with_strongest_matching_bssid() {
    let harness = start_harness(home_config());
    harness.controller.start_client("home", None).unwrap();
    assert_eq!(harness.controller.mode(), WifiMode::Client);

    // first tick runs the scan-and-bind cycle
    harness.controller.tick();

    let driver = harness.driver.lock().unwrap();
    assert_eq!(driver.scan_calls, 1);
    // both configured dwell bounds reach the driver
    assert_eq!(
        driver.last_dwell,
        Some((Duration::from_millis(120), Duration::from_millis(120)))
    );
    assert_eq!(driver.connect_calls, 1);
    let client = driver.last_client_config.as_ref().unwrap();
    assert_eq!(client.ssid.as_str(), "home");
    assert_eq!(client.password.as_str(), "secret");
    // the -55 dBm twin wins over -70, "guest" is stronger but wrong SSID
    assert_eq!(client.bssid, Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]));
    assert_eq!(client.channel, Some(6));
}

#[test]
fn connected_edge_starts_dhcp_and_raises_events() {
    let harness = start_harness(home_config());
    let (connected_tx, connected_rx) = mpsc::channel();
    let (gotip_tx, gotip_rx) = mpsc::channel();
    harness
        .events
        .register("system.wifi.sta.connected", move |_| {
            let _ = connected_tx.send(());
        });
    harness.events.register("system.wifi.sta.gotip", move |_| {
        let _ = gotip_tx.send(());
    });

    harness.controller.start_client("home", None).unwrap();
    harness.controller.tick(); // scan + connect
    harness.controller.tick(); // observe the association

    connected_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no connected event");
    gotip_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no got-ip event");

    assert_eq!(harness.netif.lock().unwrap().dhcp_started, 1);
    assert!(harness.netif.lock().unwrap().static_set.is_none());
    assert_eq!(
        harness
            .metrics
            .find(standard::NET_WIFI_NETWORK)
            .unwrap()
            .as_string(),
        "home"
    );
    // smoothed RSSI feeds both the Wi-Fi and the overall network metric
    let sq = harness.metrics.find(standard::NET_WIFI_SQ).unwrap().as_float();
    assert_eq!(sq, -55.0);
    let net_sq = harness.metrics.find(standard::NET_SQ).unwrap().as_float();
    assert_eq!(net_sq, -55.0);
}

#[test]
fn static_ip_applies_on_association() {
    let mut config = home_config();
    config.wifi_staticip.insert(
        "home".to_string(),
        "192.168.12.34,255.255.255.0,192.168.12.1".to_string(),
    );
    let harness = start_harness(config);

    harness.controller.start_client("home", None).unwrap();
    harness.controller.tick();
    harness.controller.tick();

    let netif = harness.netif.lock().unwrap();
    assert_eq!(netif.dhcp_started, 0);
    let (ip, netmask, gateway, dns) = netif.static_set.expect("static ip not applied");
    assert_eq!(ip, Ipv4Addr::new(192, 168, 12, 34));
    assert_eq!(netmask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(gateway, Ipv4Addr::new(192, 168, 12, 1));
    // the gateway doubles as main DNS
    assert_eq!(dns, Ipv4Addr::new(192, 168, 12, 1));
}

#[test]
fn roaming_uses_configured_networks() {
    let harness = start_harness(home_config());
    // open roaming: no SSID given
    harness.controller.start_client("", None).unwrap();
    harness.controller.tick();

    let driver = harness.driver.lock().unwrap();
    let client = driver.last_client_config.as_ref().unwrap();
    // "guest" is strongest but has no password configured
    assert_eq!(client.ssid.as_str(), "home");
    assert_eq!(client.bssid, Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]));
}

#[test]
fn disconnect_arms_delayed_rescan() {
    let harness = start_harness(home_config());
    let (disconnected_tx, disconnected_rx) = mpsc::channel();
    harness
        .events
        .register("system.wifi.sta.disconnected", move |_| {
            let _ = disconnected_tx.send(());
        });

    harness.controller.start_client("home", None).unwrap();
    harness.controller.tick();
    harness.controller.tick();
    assert_eq!(harness.driver.lock().unwrap().connect_calls, 1);

    // AP vanishes
    {
        let mut driver = harness.driver.lock().unwrap();
        driver.connected = false;
        driver.ip = None;
    }
    harness.controller.tick();
    disconnected_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no disconnected event");

    // the rescan is delayed, not immediate
    harness.controller.tick();
    assert_eq!(harness.driver.lock().unwrap().connect_calls, 1);
}

#[test]
fn access_point_posture_and_password_rules() {
    let mut config = Config::default();
    config
        .wifi_ap
        .insert("OVMS".to_string(), "apsecret1".to_string());
    config.wifi_ap.insert("Short".to_string(), "123".to_string());
    let harness = start_harness(config);

    harness.controller.start_access_point("OVMS").unwrap();
    assert_eq!(harness.controller.mode(), WifiMode::AccessPoint);
    // clients must not get us as DNS or default route
    assert_eq!(harness.netif.lock().unwrap().ap_dhcp, Some((false, false)));

    assert!(harness.controller.start_access_point("Short").is_err());
    assert!(harness.controller.start_access_point("Unknown").is_err());
}

#[test]
fn scan_command_json_format() {
    let harness = start_harness(home_config());
    let mut out = Vec::new();
    let code = harness.controller.scan_command(&mut out, true);
    assert_eq!(code, 0);

    let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let list = parsed["list"].as_array().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0]["ssid"], "home");
    assert_eq!(list[0]["bssid"], "aa:bb:cc:dd:ee:01");
    assert_eq!(list[0]["chan"], 6);
    assert_eq!(list[0]["rssi"], -70);
    assert_eq!(list[0]["auth"], "WPA2_PSK");
}

#[test]
fn status_output() {
    let harness = start_harness(home_config());
    harness.controller.start_client("home", None).unwrap();
    harness.controller.tick();
    harness.controller.tick();

    let mut out = Vec::new();
    let code = harness.controller.status(&mut out);
    assert_eq!(code, 0);
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Client"), "status: {text}");
    assert!(text.contains("home"), "status: {text}");
}

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ovms_firmware::can::CrtdTcpBus;
use ovms_firmware::config::{self, Config, FileStore};
use ovms_firmware::events::{start_ticker, EventBus};
use ovms_firmware::metrics::{register_standard, Metrics};
use ovms_firmware::modem::{Modem, ModemHandle, ModemOptions, ModemState, TcpModemPort};
use ovms_firmware::poller::{Poller, PollerHandle, PollerOptions};
use ovms_firmware::re::ReTools;
use ovms_firmware::shell::{self, Services};
use ovms_firmware::{thread_util, vehicle};

/// Vehicle monitor module core.
#[derive(Parser)]
#[command(name = "ovms", version)]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "ovms.json")]
    config: PathBuf,

    /// Modem endpoint (`tcp:<host>:<port>`), overrides the configured one.
    #[arg(long)]
    modem: Option<String>,

    /// CAN bridge endpoint (`tcp:<host>:<port>`), overrides the configured one.
    #[arg(long)]
    can: Option<String>,

    /// Vehicle decoder to load, overrides the configured one.
    #[arg(long)]
    vehicle: Option<String>,

    /// Run an interactive command console on stdin.
    #[arg(long)]
    console: bool,
}

/// Resolve `tcp:<host>:<port>` into a socket address string.
fn tcp_endpoint(endpoint: &str) -> Result<String> {
    endpoint
        .strip_prefix("tcp:")
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("unsupported endpoint {endpoint:?}, expected tcp:<host>:<port>"))
}

fn start_modem(
    endpoint: &str,
    config: &Arc<Mutex<Config>>,
    metrics: &Arc<Metrics>,
    events: &Arc<EventBus>,
) -> Result<ModemHandle> {
    let addr = tcp_endpoint(endpoint)?;
    info!("Connecting modem at {addr}");
    let port = TcpModemPort::connect(&addr)?;
    let auto = config.lock().unwrap().auto.modem;
    let options = ModemOptions {
        initial_state: if auto {
            ModemState::PoweringOn
        } else {
            ModemState::None
        },
        ..Default::default()
    };
    let modem = Modem::new(
        Box::new(port),
        config.clone(),
        metrics,
        events.clone(),
        options,
    );
    Ok(modem.start())
}

fn start_poller(
    endpoint: &str,
    vehicle_type: &str,
    config: &Arc<Mutex<Config>>,
    metrics: &Arc<Metrics>,
    events: &Arc<EventBus>,
) -> Result<PollerHandle> {
    let addr = tcp_endpoint(endpoint)?;
    info!("Connecting CAN bridge at {addr}");
    let bus = Arc::new(CrtdTcpBus::connect(&addr)?);
    let decoder = vehicle::create(vehicle_type, metrics, events.clone())
        .ok_or_else(|| anyhow!("unknown vehicle type {vehicle_type:?}"))?;
    let options = {
        let config = config.lock().unwrap();
        PollerOptions {
            throttling: config.poller.throttling,
            separation_time: Duration::from_millis(u64::from(config.poller.separation_time_ms)),
            ..Default::default()
        }
    };
    let poller = Poller::new(bus, decoder, events.clone(), options);
    Ok(poller.start())
}

/// Line console for driving the command surface during development.
fn console_task(services: &Services) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let argv: Vec<&str> = line.split_whitespace().collect();
        if argv.first() == Some(&"exit") {
            break;
        }
        let mut out = std::io::stdout();
        let code = shell::execute(services, &argv, &mut out);
        if code != 0 {
            warn!("Command failed with status {code}");
        }
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    info!("Starting vehicle monitor core...");
    config::init_store(Box::new(FileStore::new(args.config.clone())));
    let config = Config::load_or_default();
    // Apply configured log level
    log::set_max_level(config.log_level.as_level_filter());

    let config = Arc::new(Mutex::new(config));
    let metrics = Metrics::new();
    register_standard(&metrics);
    let events = EventBus::new();
    start_ticker(&events);

    let modem_endpoint = args
        .modem
        .clone()
        .or_else(|| {
            let endpoint = config.lock().unwrap().modem.endpoint.clone();
            if endpoint.is_empty() {
                None
            } else {
                Some(endpoint)
            }
        });
    let modem = match modem_endpoint.as_deref() {
        Some(endpoint) => match start_modem(endpoint, &config, &metrics, &events) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Modem startup failed: {e}");
                None
            }
        },
        None => None,
    };

    let can_endpoint = args.can.clone().or_else(|| {
        let endpoint = config.lock().unwrap().poller.can_endpoint.clone();
        if endpoint.is_empty() {
            None
        } else {
            Some(endpoint)
        }
    });
    let vehicle_type = args
        .vehicle
        .clone()
        .unwrap_or_else(|| config.lock().unwrap().auto.vehicle_type.clone());
    let poller = match can_endpoint.as_deref() {
        Some(endpoint) if !vehicle_type.is_empty() => {
            match start_poller(endpoint, &vehicle_type, &config, &metrics, &events) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Poller startup failed: {e}");
                    None
                }
            }
        }
        Some(_) => {
            warn!("CAN endpoint configured but no vehicle type selected");
            None
        }
        None => None,
    };

    let services = Services {
        config: config.clone(),
        metrics: metrics.clone(),
        events: events.clone(),
        wifi: None, // bound by the platform integration, absent on the host
        modem: modem.clone(),
        poller: poller.clone(),
        re: ReTools::new(),
    };

    info!("All systems running!");

    if args.console {
        console_task(&services);
        if let Some(modem) = &services.modem {
            modem.shutdown();
        }
        if let Some(poller) = &services.poller {
            poller.shutdown();
        }
        return Ok(());
    }

    // Status loop - periodic subsystem summaries
    let status = thread_util::spawn_named("status", move || loop {
        std::thread::sleep(Duration::from_secs(5));
        if let Some(poller) = &poller {
            info!("Poller state: {}", poller.state().label());
        }
        if let Some(metric) = metrics.find(ovms_firmware::metrics::standard::NET_MDM_NETREG) {
            if metric.is_defined() {
                info!("Modem netreg: {}", metric.as_string());
            }
        }
    });
    status.join().ok();
    Ok(())
}

//! Command surface exposed to the shell framework.
//!
//! The interactive console itself lives outside this core; it hands us an
//! argv-style token list and a writer. Commands return 0 on success and
//! nonzero after printing an error to the writer.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::modem::{ModemHandle, ModemState};
use crate::poller::{PollerHandle, PollerState};
use crate::re::{ReFlag, ReMode, ReTools};
use crate::wifi::{parse_bssid, WifiController};

/// Handles to the running subsystems, as available.
pub struct Services {
    pub config: Arc<Mutex<Config>>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<EventBus>,
    pub wifi: Option<Arc<WifiController>>,
    pub modem: Option<ModemHandle>,
    pub poller: Option<PollerHandle>,
    pub re: Arc<ReTools>,
}

/// Print a failure and map it to the exit status.
fn report(result: anyhow::Result<()>, out: &mut dyn Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(out, "ERROR: {e}");
            1
        }
    }
}

/// Dispatch one command line.
pub fn execute(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    match argv {
        [] => 0,
        ["wifi", rest @ ..] => wifi_cmd(services, rest, out),
        ["re", rest @ ..] => re_cmd(services, rest, out),
        ["modem", rest @ ..] => modem_cmd(services, rest, out),
        ["poller", rest @ ..] => poller_cmd(services, rest, out),
        ["metrics", rest @ ..] => metrics_cmd(services, rest, out),
        [other, ..] => {
            let _ = writeln!(out, "Unknown command: {other}");
            1
        }
    }
}

fn wifi_cmd(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    let Some(wifi) = services.wifi.as_ref() else {
        let _ = writeln!(out, "ERROR: wifi not available");
        return 1;
    };
    match argv {
        ["mode", "client", rest @ ..] => {
            let (ssid, bssid) = match rest {
                [] => ("", None),
                [ssid] => (*ssid, None),
                [ssid, bssid] => match parse_bssid(bssid) {
                    Some(mac) => (*ssid, Some(mac)),
                    None => {
                        let _ = writeln!(out, "ERROR: malformed BSSID {bssid:?}");
                        return 1;
                    }
                },
                _ => {
                    let _ = writeln!(out, "Usage: wifi mode client [<ssid>] [<bssid>]");
                    return 1;
                }
            };
            report(wifi.start_client(ssid, bssid), out)
        }
        ["mode", "ap", ssid] => report(wifi.start_access_point(ssid), out),
        ["mode", "apclient", ap_ssid, rest @ ..] => {
            let (sta_ssid, bssid) = match rest {
                [] => ("", None),
                [ssid] => (*ssid, None),
                [ssid, bssid] => match parse_bssid(bssid) {
                    Some(mac) => (*ssid, Some(mac)),
                    None => {
                        let _ = writeln!(out, "ERROR: malformed BSSID {bssid:?}");
                        return 1;
                    }
                },
                _ => {
                    let _ = writeln!(
                        out,
                        "Usage: wifi mode apclient <ap_ssid> [<sta_ssid>] [<sta_bssid>]"
                    );
                    return 1;
                }
            };
            report(wifi.start_ap_client(ap_ssid, sta_ssid, bssid), out)
        }
        ["mode", "off"] => report(wifi.stop(), out),
        ["scan"] => wifi.scan_command(out, false),
        ["scan", "-j"] => wifi.scan_command(out, true),
        ["status"] => wifi.status(out),
        ["reconnect"] => wifi.reconnect(out),
        ["ip", rest @ ..] => wifi.command_ip(rest, out),
        _ => {
            let _ = writeln!(
                out,
                "Usage: wifi mode client|ap|apclient|off | scan [-j] | status | reconnect | ip ..."
            );
            1
        }
    }
}

fn re_cmd(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    let re = &services.re;
    match argv {
        ["start"] => {
            let Some(poller) = services.poller.as_ref() else {
                let _ = writeln!(out, "ERROR: poller not available");
                return 1;
            };
            if re.start(poller) {
                let _ = writeln!(out, "RE tools running");
                0
            } else {
                let _ = writeln!(out, "Error: RE tools already running");
                1
            }
        }
        ["stop"] => {
            if re.stop() {
                0
            } else {
                let _ = writeln!(out, "Error: RE tools not running");
                1
            }
        }
        ["clear"] => {
            re.clear();
            0
        }
        ["list", rest @ ..] => {
            let (which, filter) = match rest {
                ["changed", rest @ ..] => (Some(ReFlag::Changed), rest.first().copied()),
                ["discovered", rest @ ..] => (Some(ReFlag::Discovered), rest.first().copied()),
                [filter] => (None, Some(*filter)),
                _ => (None, None),
            };
            re.list(filter, which, out);
            0
        }
        ["key", "set", id, bytes @ ..] => {
            let Some(id) = parse_hex(id) else {
                let _ = writeln!(out, "ERROR: bad id {id:?}");
                return 1;
            };
            let mut mask = 0u8;
            for b in bytes {
                match b.parse::<u8>() {
                    Ok(b) if (1..=8).contains(&b) => mask |= 1 << (b - 1),
                    _ => {
                        let _ = writeln!(out, "ERROR: byte positions are 1..8");
                        return 1;
                    }
                }
            }
            re.key_set(id, mask);
            let _ = writeln!(out, "Set ID {id:x} to bytes 0x{mask:02x}");
            0
        }
        ["key", "clear", id] => {
            let Some(id) = parse_hex(id) else {
                let _ = writeln!(out, "ERROR: bad id {id:?}");
                return 1;
            };
            if re.key_clear(id) {
                let _ = writeln!(out, "Cleared ID key");
                0
            } else {
                let _ = writeln!(out, "ERROR: no key for ID {id:x}");
                1
            }
        }
        ["obdii", "standard", min, max] => match (parse_hex(min), parse_hex(max)) {
            (Some(min), Some(max)) => {
                re.set_obdii_std(min, max);
                let _ = writeln!(out, "Set OBDII standard ID range {min:03x}-{max:03x}");
                0
            }
            _ => {
                let _ = writeln!(out, "ERROR: bad id range");
                1
            }
        },
        ["obdii", "extended", min, max] => match (parse_hex(min), parse_hex(max)) {
            (Some(min), Some(max)) => {
                re.set_obdii_ext(min, max);
                let _ = writeln!(out, "Set OBDII extended ID range {min:08x}-{max:08x}");
                0
            }
            _ => {
                let _ = writeln!(out, "ERROR: bad id range");
                1
            }
        },
        ["mode", "record"] => {
            re.set_mode(ReMode::Record);
            let _ = writeln!(out, "Now running in record mode");
            0
        }
        ["mode", "discover"] => {
            re.set_mode(ReMode::Discover);
            let _ = writeln!(out, "Now running in discover mode");
            0
        }
        ["save", path] => match re.save(path) {
            Ok(count) => {
                let _ = writeln!(out, "Saved {count} records to {path}");
                0
            }
            Err(e) => {
                let _ = writeln!(out, "ERROR: {e}");
                1
            }
        },
        ["status"] => {
            re.status(out);
            0
        }
        _ => {
            let _ = writeln!(
                out,
                "Usage: re start|stop|clear|list|key set|key clear|obdii standard|obdii extended|mode record|mode discover|save|status"
            );
            1
        }
    }
}

fn modem_cmd(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    let Some(modem) = services.modem.as_ref() else {
        let _ = writeln!(out, "ERROR: modem not available");
        return 1;
    };
    match argv {
        ["status"] => {
            let _ = write!(out, "{}", modem.status());
            0
        }
        ["cmd", rest @ ..] if !rest.is_empty() => {
            let command = rest.join(" ");
            match modem.command(&command, Duration::from_secs(5)) {
                Ok(output) => {
                    let _ = write!(out, "{output}");
                    0
                }
                Err(e) => {
                    let _ = writeln!(out, "ERROR: {e}");
                    1
                }
            }
        }
        ["state", name] => match parse_modem_state(name) {
            Some(state) => {
                modem.set_state(state);
                0
            }
            None => {
                let _ = writeln!(out, "ERROR: unknown state {name:?}");
                1
            }
        },
        _ => {
            let _ = writeln!(out, "Usage: modem status | cmd <at command> | state <name>");
            1
        }
    }
}

fn poller_cmd(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    let Some(poller) = services.poller.as_ref() else {
        let _ = writeln!(out, "ERROR: poller not available");
        return 1;
    };
    match argv {
        ["status"] => {
            let _ = write!(out, "{}", poller.status());
            0
        }
        ["pause"] => {
            poller.pause();
            0
        }
        ["resume"] => {
            poller.resume();
            0
        }
        ["state", name] => {
            let state = match name.to_ascii_lowercase().as_str() {
                "shutdown" => PollerState::Shutdown,
                "alive" => PollerState::Alive,
                "ready" => PollerState::Ready,
                "charging" => PollerState::Charging,
                _ => {
                    let _ = writeln!(out, "ERROR: unknown state {name:?}");
                    return 1;
                }
            };
            poller.set_state(state);
            0
        }
        _ => {
            let _ = writeln!(out, "Usage: poller status | pause | resume | state <name>");
            1
        }
    }
}

fn metrics_cmd(services: &Services, argv: &[&str], out: &mut dyn Write) -> i32 {
    match argv {
        ["list"] => {
            for line in services.metrics.list("") {
                let _ = writeln!(out, "{line}");
            }
            0
        }
        ["list", prefix] => {
            for line in services.metrics.list(prefix) {
                let _ = writeln!(out, "{line}");
            }
            0
        }
        _ => {
            let _ = writeln!(out, "Usage: metrics list [<prefix>]");
            1
        }
    }
}

fn parse_hex(text: &str) -> Option<u32> {
    u32::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

fn parse_modem_state(name: &str) -> Option<ModemState> {
    Some(match name.to_ascii_lowercase().as_str() {
        "checkpoweroff" => ModemState::CheckPowerOff,
        "poweringon" => ModemState::PoweringOn,
        "identify" => ModemState::Identify,
        "poweredon" => ModemState::PoweredOn,
        "muxstart" => ModemState::MuxStart,
        "netwait" => ModemState::NetWait,
        "netstart" => ModemState::NetStart,
        "netloss" => ModemState::NetLoss,
        "nethold" => ModemState::NetHold,
        "netsleep" => ModemState::NetSleep,
        "netmode" => ModemState::NetMode,
        "netdeepsleep" => ModemState::NetDeepSleep,
        "poweringoff" => ModemState::PoweringOff,
        "poweredoff" => ModemState::PoweredOff,
        "poweroffon" => ModemState::PowerOffOn,
        "development" => ModemState::Development,
        _ => return None,
    })
}

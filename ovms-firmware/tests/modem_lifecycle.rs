//! Modem state machine integration tests against a scripted modem.
//!
//! The port is an in-memory channel pair; the far side runs a minimal
//! SIM7600-flavored script: AT banner identification, CMUX establishment,
//! network registration, a data call, and NMEA once GPS is enabled.

use ovms_firmware::config::Config;
use ovms_firmware::events::EventBus;
use ovms_firmware::metrics::{register_standard, standard, Metrics};
use ovms_firmware::modem::{Modem, ModemOptions, ModemPort, ModemState};
use ovms_gsmmux_lib::{fcs, Mux, EA, PF, SABM, SOF, UIH};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct TestPort {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    tx: Sender<Vec<u8>>,
    power: Arc<AtomicBool>,
}

impl ModemPort for TestPort {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(data) => self.pending.extend(data),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "sim gone",
                    ))
                }
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sim gone"))
    }

    fn set_power(&mut self, on: bool) {
        self.power.store(on, Ordering::Relaxed);
    }
}

/// Scripted modem: line mode until CMUX, then GSM 07.10 frames.
struct SimModem {
    to_modem: Sender<Vec<u8>>,
    silent: Arc<AtomicBool>,
    muxmode: bool,
    encoder: Mux,
    frame: Vec<u8>,
    frame_len: usize,
    frame_ipos: usize,
    frame_more: bool,
    line: Vec<u8>,
    chan_lines: Vec<Vec<u8>>,
}

impl SimModem {
    fn new(to_modem: Sender<Vec<u8>>, silent: Arc<AtomicBool>) -> Self {
        Self {
            to_modem,
            silent,
            muxmode: false,
            encoder: Mux::new(4, 2),
            frame: Vec::new(),
            frame_len: 0,
            frame_ipos: 0,
            frame_more: false,
            line: Vec::new(),
            chan_lines: vec![Vec::new(); 6],
        }
    }

    fn on_bytes(&mut self, data: &[u8]) {
        if self.silent.load(Ordering::Relaxed) {
            return;
        }
        for &b in data {
            if self.muxmode {
                self.feed_frame(b);
            } else {
                self.feed_line(b);
            }
        }
    }

    fn send_raw(&self, data: &[u8]) {
        let _ = self.to_modem.send(data.to_vec());
    }

    fn send_mux_lines(&mut self, channel: u8, lines: &[&str]) {
        for line in lines {
            let payload = format!("\r\n{line}\r\n");
            let frame = self.encoder.tx(channel, payload.as_bytes());
            let _ = self.to_modem.send(frame);
        }
    }

    fn feed_line(&mut self, b: u8) {
        if b != b'\r' && b != b'\n' {
            self.line.push(b);
            return;
        }
        let command = String::from_utf8_lossy(&self.line).trim().to_uppercase();
        self.line.clear();
        if command.is_empty() {
            return;
        }
        match command.as_str() {
            "ATI" => self.send_raw(
                b"\r\nManufacturer: SIMCOM INCORPORATED\r\nModel: SIMCOM_SIM7600G\r\nRevision: LE20B04SIM7600M22\r\n\r\nOK\r\n",
            ),
            "AT+CMUX=0" => {
                self.send_raw(b"\r\nOK\r\n");
                self.muxmode = true;
            }
            _ => self.send_raw(b"\r\nOK\r\n"),
        }
    }

    fn feed_frame(&mut self, b: u8) {
        if self.frame.is_empty() && b != SOF {
            return;
        }
        if self.frame.len() == 1 && b == SOF {
            return;
        }
        self.frame.push(b);
        match self.frame.len() {
            4 => {
                self.frame_more = b & EA == 0;
                self.frame_len = (b >> 1) as usize;
                if self.frame_more {
                    self.frame_len += 7;
                    self.frame_ipos = 5;
                } else {
                    self.frame_len += 6;
                    self.frame_ipos = 4;
                }
            }
            5 if self.frame_more => {
                self.frame_len += (b as usize) << 7;
                self.frame_more = false;
            }
            n if n > 4 && n == self.frame_len => {
                let frame = std::mem::take(&mut self.frame);
                self.frame_len = 0;
                if b != SOF {
                    return;
                }
                let expected = 0xFF - fcs::add_block(fcs::INIT, &frame[1..self.frame_ipos]);
                if expected != frame[frame.len() - 2] {
                    return;
                }
                let channel = frame[1] >> 2;
                let control = frame[2];
                let payload = frame[self.frame_ipos..frame.len() - 2].to_vec();
                self.handle_frame(channel, control, &payload);
            }
            _ => {}
        }
    }

    fn handle_frame(&mut self, channel: u8, control: u8, payload: &[u8]) {
        if control == SABM + PF {
            let addr = (channel << 2) | EA | 0x02;
            let mut ua = vec![SOF, addr, 0x63 + PF, EA, 0x00, SOF];
            ua[4] = fcs::calc(&ua[1..4]);
            self.send_raw(&ua);
            return;
        }
        if control != UIH + PF {
            return;
        }
        let mut commands = Vec::new();
        {
            let buffer = &mut self.chan_lines[channel as usize % 6];
            for &b in payload {
                if b == b'\r' || b == b'\n' {
                    if !buffer.is_empty() {
                        commands
                            .push(String::from_utf8_lossy(buffer).trim().to_uppercase());
                        buffer.clear();
                    }
                } else {
                    buffer.push(b);
                }
            }
        }
        for command in commands {
            self.handle_mux_command(channel, &command);
        }
    }

    fn handle_mux_command(&mut self, channel: u8, command: &str) {
        if command.contains("+CGREG?") {
            self.send_mux_lines(channel, &["+CREG: 0,1", "+CGREG: 0,1", "+CEREG: 0,1", "OK"]);
        } else if command.contains("+CCLK?") {
            self.send_mux_lines(
                channel,
                &["+CSQ: 17,99", "+COPS: 0,0,\"SimNet\",7", "OK"],
            );
        } else if command.starts_with("ATD*99") {
            self.send_mux_lines(channel, &["CONNECT"]);
        } else if command.contains("+CGPSNMEA") {
            self.send_mux_lines(channel, &["OK"]);
            let rmc = nmea("GPRMC,122310.00,A,5207.6493,N,00445.2725,E,10.0,83.5,231124,,,A");
            let gns = nmea("GNGNS,122310.00,5207.6493,N,00445.2725,E,AAN,12,0.9,5.2,45.0,,");
            for sentence in [rmc, gns] {
                let frame = self.encoder.tx(1, sentence.as_bytes());
                let _ = self.to_modem.send(frame);
            }
        } else {
            self.send_mux_lines(channel, &["OK"]);
        }
    }
}

fn nmea(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}\r\n")
}

struct Harness {
    metrics: Arc<Metrics>,
    events: Arc<EventBus>,
    power: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
    handle: ovms_firmware::modem::ModemHandle,
}

fn start_harness(initial: ModemState, tick: Duration, silent_at_start: bool) -> Harness {
    let metrics = Metrics::new();
    register_standard(&metrics);
    let events = EventBus::new();

    let (to_modem_tx, to_modem_rx) = mpsc::channel();
    let (from_modem_tx, from_modem_rx) = mpsc::channel::<Vec<u8>>();
    let power = Arc::new(AtomicBool::new(false));
    let silent = Arc::new(AtomicBool::new(silent_at_start));

    let port = TestPort {
        rx: to_modem_rx,
        pending: VecDeque::new(),
        tx: from_modem_tx,
        power: power.clone(),
    };

    let mut sim = SimModem::new(to_modem_tx, silent.clone());
    std::thread::spawn(move || {
        while let Ok(data) = from_modem_rx.recv() {
            sim.on_bytes(&data);
        }
    });

    let config = Arc::new(Mutex::new(Config::default()));
    let options = ModemOptions {
        initial_state: initial,
        tick_interval: tick,
        io_timeout: Duration::from_millis(5),
    };
    let modem = Modem::new(Box::new(port), config, &metrics, events.clone(), options);
    let handle = modem.start();

    Harness {
        metrics,
        events,
        power,
        silent,
        handle,
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn power_on_to_netmode() {
    let (netmode_tx, netmode_rx) = mpsc::channel();
    let (netup_tx, netup_rx) = mpsc::channel();

    let harness = start_harness(ModemState::PoweringOn, Duration::from_millis(20), false);
    harness.events.register("system.modem.netmode", move |_| {
        let _ = netmode_tx.send(());
    });
    harness.events.register("system.modem.netup", move |_| {
        let _ = netup_tx.send(());
    });

    netmode_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("modem did not reach NetMode");
    netup_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("PPP link did not come up");

    assert!(harness.power.load(Ordering::Relaxed));
    let metrics = &harness.metrics;
    assert_eq!(
        metrics.find(standard::NET_MDM_MODEL).unwrap().as_string(),
        "SIM7600"
    );
    assert_eq!(
        metrics.find(standard::NET_MDM_NETREG).unwrap().as_string(),
        "RegisteredHome"
    );

    // the GPS startup on the command channel produced NMEA on channel 1
    wait_until("GPS position", || {
        metrics.find(standard::V_POS_LATITUDE).unwrap().is_defined()
    });
    let lat = metrics.find(standard::V_POS_LATITUDE).unwrap().as_float();
    assert!((lat - 52.1275).abs() < 0.001, "lat {lat}");

    let status = harness.handle.status();
    assert!(status.contains("SIM7600"), "status: {status}");
    assert!(status.contains("NetMode"), "status: {status}");
    harness.handle.shutdown();
}

#[test]
fn identify_timeouts_escalate_to_power_cycle() {
    let (poweringon_tx, poweringon_rx) = mpsc::channel();
    let (poweredon_tx, poweredon_rx) = mpsc::channel();

    let harness = start_harness(ModemState::Identify, Duration::from_millis(10), true);
    harness
        .events
        .register("system.modem.poweringon", move |_| {
            let _ = poweringon_tx.send(());
        });
    harness.events.register("system.modem.poweredon", move |_| {
        let _ = poweredon_tx.send(());
    });

    // three identify timeouts escalate into a power cycle
    poweringon_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no power cycle after repeated identify timeouts");

    // once the modem answers again, identification completes
    harness.silent.store(false, Ordering::Relaxed);
    poweredon_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("modem did not recover after power cycle");
    assert!(harness.power.load(Ordering::Relaxed));
    harness.handle.shutdown();
}

#[test]
fn at_command_facade_collects_response() {
    let harness = start_harness(ModemState::PoweringOn, Duration::from_millis(20), false);
    let (netwait_tx, netwait_rx) = mpsc::channel();
    harness.events.register("system.modem.netwait", move |_| {
        let _ = netwait_tx.send(());
    });
    netwait_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("mux never came up");

    let output = harness
        .handle
        .command("AT+CPIN?", Duration::from_secs(5))
        .expect("command failed");
    assert!(output.contains("OK"), "output: {output}");
    harness.handle.shutdown();
}

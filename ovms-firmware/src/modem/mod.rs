//! Cellular modem subsystem.
//!
//! One task owns the serial port, the receive buffer, the GSM 07.10 mux
//! and the layers on top of it (AT command façade, NMEA, PPP). A control
//! channel carries state requests and AT commands from other tasks; a
//! lifecycle state machine drives power, identification, mux startup and
//! the data connection.
//!
//! Architecture:
//! - Modem task: owns the port, pumps bytes, ticks the state machine
//! - AT commands are serialized through the task; callers get their reply
//!   through a oneshot channel
//! - Incoming mux payloads route by channel: NMEA lines to the parser,
//!   data bytes to PPP, everything else to the line handler

pub mod driver;
pub mod nmea;
pub mod ppp;

use log::{debug, error, info, warn};
use ovms_buffer_lib::Buffer;
use ovms_gsmmux_lib::{Mux, MuxEvent};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::events::EventBus;
use crate::metrics::{standard, Metric, Metrics, Unit};
use crate::thread_util;
use crate::watchdog::WatchdogHandle;
use driver::ModemDriver;
use nmea::NmeaParser;
use ppp::{NullNetStack, PppChannel};

/// Receive buffer between the port and the framer.
const RX_BUFFER_SIZE: usize = 4096;

/// Ticks of line silence treated as a powered-off modem.
const QUIESCENT_TICKS: u32 = 10;

/// Consecutive state timeouts before escalating to a power cycle.
const MAX_STATE_TIMEOUTS: u32 = 3;

/// Seconds between status poller rounds in the connected states.
const STATUS_POLL_INTERVAL: u32 = 30;

/// Modem lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    /// Initialised, and idle.
    None,
    /// Check modem is powered off, then => PoweredOff.
    CheckPowerOff,
    /// Power on modem, then => Identify.
    PoweringOn,
    /// Identify the modem model, then rebind the driver.
    Identify,
    /// Check modem activity, then => MuxStart.
    PoweredOn,
    /// Start mux, then => NetWait.
    MuxStart,
    /// Wait for cellular service, then => NetStart.
    NetWait,
    /// Start network, either => NetMode or => NetHold.
    NetStart,
    /// Handle loss of network connectivity.
    NetLoss,
    /// MUX established, but no data.
    NetHold,
    /// Power save: MUX established, but no data.
    NetSleep,
    /// MUX and data established, PPP up.
    NetMode,
    /// Deep power save.
    NetDeepSleep,
    /// Power off modem, then => CheckPowerOff.
    PoweringOff,
    /// Maintain a powered off state.
    PoweredOff,
    /// Power cycle modem, then => PoweringOn.
    PowerOffOn,
    /// Let the developer handle the modem themselves.
    Development,
}

impl std::fmt::Display for ModemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::CheckPowerOff => "CheckPowerOff",
            Self::PoweringOn => "PoweringOn",
            Self::Identify => "Identify",
            Self::PoweredOn => "PoweredOn",
            Self::MuxStart => "MuxStart",
            Self::NetWait => "NetWait",
            Self::NetStart => "NetStart",
            Self::NetLoss => "NetLoss",
            Self::NetHold => "NetHold",
            Self::NetSleep => "NetSleep",
            Self::NetMode => "NetMode",
            Self::NetDeepSleep => "NetDeepSleep",
            Self::PoweringOff => "PoweringOff",
            Self::PoweredOff => "PoweredOff",
            Self::PowerOffOn => "PowerOffOn",
            Self::Development => "Development",
        };
        write!(f, "{name}")
    }
}

impl ModemState {
    /// Event topic raised when the state is entered, if any.
    #[must_use]
    fn event_topic(self) -> Option<&'static str> {
        match self {
            Self::PoweringOn => Some("system.modem.poweringon"),
            Self::PoweredOn => Some("system.modem.poweredon"),
            Self::MuxStart => Some("system.modem.muxstart"),
            Self::NetWait => Some("system.modem.netwait"),
            Self::NetStart => Some("system.modem.netstart"),
            Self::NetLoss => Some("system.modem.netloss"),
            Self::NetHold => Some("system.modem.nethold"),
            Self::NetMode => Some("system.modem.netmode"),
            Self::PoweringOff => Some("system.modem.poweringoff"),
            Self::PoweredOff => Some("system.modem.poweredoff"),
            _ => None,
        }
    }
}

/// Network registration status, worst to best; the modem's overall status
/// is the best across the registration types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetReg {
    Unknown,
    NotRegistered,
    DeniedRegistration,
    Searching,
    Registered,
    RegisteredRoaming,
    RegisteredHome,
}

impl NetReg {
    #[must_use]
    pub fn is_registered(self) -> bool {
        self >= Self::Registered
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::NotRegistered => "NotRegistered",
            Self::DeniedRegistration => "DeniedRegistration",
            Self::Searching => "Searching",
            Self::Registered => "Registered",
            Self::RegisteredRoaming => "RegisteredRoaming",
            Self::RegisteredHome => "RegisteredHome",
        }
    }
}

/// Registration report flavors, one slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegType {
    Gsm = 0,
    Gprs = 1,
    Eps = 2,
}

/// Errors surfaced to AT command callers.
#[derive(Debug, Clone)]
pub enum CommandError {
    /// No terminator within the caller's timeout.
    Timeout,
    /// Another command is in flight.
    Busy,
    /// The modem task is gone.
    ChannelClosed,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Command timeout"),
            Self::Busy => write!(f, "Command channel busy"),
            Self::ChannelClosed => write!(f, "Modem task not running"),
        }
    }
}

impl std::error::Error for CommandError {}

/// The physical link to the modem plus its power controls.
pub trait ModemPort: Send {
    /// Read available bytes, waiting at most `timeout`. `Ok(0)` means no
    /// data arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Drive the power enable line. Default: not wired.
    fn set_power(&mut self, on: bool) {
        let _ = on;
    }
}

/// Modem behind a TCP link (ser2net, or the mock modem server).
pub struct TcpModemPort {
    stream: TcpStream,
}

impl TcpModemPort {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }
}

impl ModemPort for TcpModemPort {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.stream.set_read_timeout(Some(timeout))?;
        match self.stream.read(buf) {
            Ok(0) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "modem link closed",
            )),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data)
    }
}

/// Requests handled by the modem task.
pub enum ModemRequest {
    SetState(ModemState),
    Command {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    MuxTx {
        channel: u8,
        data: Vec<u8>,
    },
    Status {
        reply: oneshot::Sender<String>,
    },
    Shutdown,
}

/// Cloneable handle to the modem task.
#[derive(Clone)]
pub struct ModemHandle {
    tx: Sender<ModemRequest>,
}

impl ModemHandle {
    pub fn set_state(&self, state: ModemState) {
        let _ = self.tx.send(ModemRequest::SetState(state));
    }

    /// Run an AT command and wait for its terminated response.
    pub fn command(&self, command: &str, timeout: Duration) -> Result<String, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ModemRequest::Command {
                command: command.to_string(),
                timeout,
                reply: reply_tx,
            })
            .map_err(|_| CommandError::ChannelClosed)?;
        reply_rx
            .recv_timeout(timeout + Duration::from_secs(1))
            .map_err(|_| CommandError::Timeout)?
    }

    /// Queue raw bytes for one mux channel.
    pub fn mux_tx(&self, channel: u8, data: &[u8]) {
        let _ = self.tx.send(ModemRequest::MuxTx {
            channel,
            data: data.to_vec(),
        });
    }

    #[must_use]
    pub fn status(&self) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ModemRequest::Status { reply: reply_tx })
            .is_err()
        {
            return "Modem task not running".to_string();
        }
        reply_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| "Modem task not responding".to_string())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ModemRequest::Shutdown);
    }
}

/// Tuning knobs; the defaults suit real hardware, tests shrink the tick.
pub struct ModemOptions {
    pub initial_state: ModemState,
    pub tick_interval: Duration,
    pub io_timeout: Duration,
}

impl Default for ModemOptions {
    fn default() -> Self {
        Self {
            initial_state: ModemState::CheckPowerOff,
            tick_interval: Duration::from_secs(1),
            io_timeout: Duration::from_millis(20),
        }
    }
}

struct PendingCommand {
    channel: u8,
    output: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<String, CommandError>>,
}

pub struct Modem {
    port: Box<dyn ModemPort>,
    driver: Box<dyn ModemDriver>,
    buffer: Buffer,
    options: ModemOptions,

    state: ModemState,
    state_ticker: u32,
    timeout_ticks: u32,
    timeout_goto: ModemState,
    timeout_count: u32,

    mux: Option<Mux>,
    nmea: NmeaParser,
    ppp: PppChannel,
    pending: Option<PendingCommand>,

    netreg: [NetReg; 3],
    provider: String,
    last_rx: Instant,
    io_errors: u32,

    m_model: Arc<Metric>,
    m_netreg: Arc<Metric>,
    m_sq: Arc<Metric>,
    /// Overall network signal quality, shared with the other bearers.
    m_net_sq: Arc<Metric>,
    m_provider: Arc<Metric>,
    m_network: Arc<Metric>,

    config: Arc<Mutex<Config>>,
    events: Arc<EventBus>,
}

impl Modem {
    pub fn new(
        port: Box<dyn ModemPort>,
        config: Arc<Mutex<Config>>,
        metrics: &Metrics,
        events: Arc<EventBus>,
        options: ModemOptions,
    ) -> Self {
        let nmea = NmeaParser::new(metrics, events.clone());
        let driver: Box<dyn ModemDriver> = Box::new(driver::AutoDriver);
        let ppp = PppChannel::new(
            driver.channel_data(),
            Box::<NullNetStack>::default(),
            events.clone(),
        );
        Self {
            port,
            driver,
            buffer: Buffer::new(RX_BUFFER_SIZE),
            options,
            state: ModemState::None,
            state_ticker: 0,
            timeout_ticks: 0,
            timeout_goto: ModemState::None,
            timeout_count: 0,
            mux: None,
            nmea,
            ppp,
            pending: None,
            netreg: [NetReg::Unknown; 3],
            provider: String::new(),
            last_rx: Instant::now(),
            io_errors: 0,
            m_model: metrics.init_string(standard::NET_MDM_MODEL, 0),
            m_netreg: metrics.init_string(standard::NET_MDM_NETREG, 0),
            m_sq: metrics.init_float(standard::NET_MDM_SQ, crate::metrics::STALE_MID, Unit::Dbm),
            m_net_sq: metrics.init_float(standard::NET_SQ, crate::metrics::STALE_MID, Unit::Dbm),
            m_provider: metrics.init_string(standard::NET_PROVIDER, 0),
            m_network: metrics.init_string(standard::NET_MDM_NETWORK, 0),
            config,
            events,
        }
    }

    /// Spawn the modem task and return its control handle.
    pub fn start(self) -> ModemHandle {
        let (tx, rx) = mpsc::channel();
        thread_util::spawn_named("modem", move || self.run(&rx));
        ModemHandle { tx }
    }

    fn run(mut self, rx: &Receiver<ModemRequest>) {
        let watchdog = WatchdogHandle::register("modem");
        info!("Modem task started");
        let initial = self.options.initial_state;
        self.set_state(initial);
        let mut last_tick = Instant::now();

        loop {
            watchdog.feed();

            while let Ok(request) = rx.try_recv() {
                if !self.handle_request(request) {
                    info!("Modem task shutting down");
                    return;
                }
            }

            self.pump_port();

            if self.ppp.is_connected() {
                if let Some(data) = self.ppp.pump_output() {
                    let channel = self.ppp.channel();
                    self.muxtx(channel, &data);
                }
            }

            if last_tick.elapsed() >= self.options.tick_interval {
                last_tick = Instant::now();
                self.ticker();
            }

            self.check_command_timeout();
        }
    }

    fn handle_request(&mut self, request: ModemRequest) -> bool {
        match request {
            ModemRequest::SetState(state) => {
                info!("External state request: {state}");
                self.set_state(state);
            }
            ModemRequest::Command {
                command,
                timeout,
                reply,
            } => self.start_command(&command, timeout, reply),
            ModemRequest::MuxTx { channel, data } => self.muxtx(channel, &data),
            ModemRequest::Status { reply } => {
                let _ = reply.send(self.status_report());
            }
            ModemRequest::Shutdown => return false,
        }
        true
    }

    fn pump_port(&mut self) {
        let mut chunk = [0u8; 512];
        match self.port.read(&mut chunk, self.options.io_timeout) {
            Ok(0) => {}
            Ok(n) => {
                self.last_rx = Instant::now();
                if self.buffer.push_all(&chunk[..n]).is_err() {
                    warn!("Modem rx buffer overflow, dropping {n} bytes");
                }
                self.process_incoming();
            }
            Err(e) => {
                self.io_errors += 1;
                debug!("Modem port read error: {e}");
                std::thread::sleep(self.options.io_timeout);
            }
        }
    }

    fn process_incoming(&mut self) {
        if self.mux.is_some() {
            let mut tx_out = Vec::new();
            let mut events = Vec::new();
            if let Some(mux) = self.mux.as_mut() {
                mux.process(&mut self.buffer, &mut tx_out, &mut events);
            }
            if !tx_out.is_empty() {
                self.port_write(&tx_out);
            }
            for event in events {
                match event {
                    MuxEvent::ChannelOpen(channel) => {
                        debug!("Mux channel {channel} open");
                    }
                    MuxEvent::MuxUp => {
                        info!("Mux is up");
                    }
                    MuxEvent::Incoming(channel) => self.incoming_mux_data(channel),
                }
            }
        } else {
            while let Some(line) = self.buffer.read_line() {
                if !line.is_empty() {
                    self.standard_line_handler(0, &line);
                }
                if self.mux.is_some() {
                    // mux mode just started, remaining bytes are frames
                    if !self.buffer.is_empty() {
                        self.process_incoming();
                    }
                    break;
                }
            }
        }
    }

    fn incoming_mux_data(&mut self, channel: u8) {
        if channel == self.driver.channel_data() && self.ppp.is_connected() {
            let mut data = Vec::new();
            if let Some(buf) = self.mux.as_mut().and_then(|m| m.channel_buffer(channel)) {
                let mut chunk = [0u8; 256];
                loop {
                    let n = buf.pop_n(&mut chunk);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&chunk[..n]);
                }
            }
            self.ppp.incoming(&data);
            return;
        }

        let mut lines = Vec::new();
        if let Some(buf) = self.mux.as_mut().and_then(|m| m.channel_buffer(channel)) {
            while let Some(line) = buf.read_line() {
                if !line.is_empty() {
                    lines.push(line);
                }
            }
        }
        if channel == self.driver.channel_nmea() {
            for line in &lines {
                self.nmea.incoming_line(line);
            }
        } else {
            for line in &lines {
                self.standard_line_handler(channel, line);
            }
        }
    }

    fn port_write(&mut self, data: &[u8]) {
        if let Err(e) = self.port.write_all(data) {
            self.io_errors += 1;
            warn!("Modem port write error: {e}");
        }
    }

    fn muxtx(&mut self, channel: u8, data: &[u8]) {
        if let Some(mux) = self.mux.as_mut() {
            let frame = mux.tx(channel, data);
            self.port_write(&frame);
        } else {
            error!("Attempt to transmit on non running mux");
        }
    }

    // ---- AT command façade -------------------------------------------------

    fn start_command(
        &mut self,
        command: &str,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, CommandError>>,
    ) {
        if self.pending.is_some() {
            let _ = reply.send(Err(CommandError::Busy));
            return;
        }
        let mut data = command.to_string();
        if !data.ends_with('\n') {
            data.push_str("\r\n");
        }
        let channel = if self.mux.is_some() {
            let channel = self.driver.channel_cmd();
            self.muxtx(channel, data.as_bytes());
            channel
        } else {
            self.port_write(data.as_bytes());
            0
        };
        self.pending = Some(PendingCommand {
            channel,
            output: String::new(),
            deadline: Instant::now() + timeout,
            reply,
        });
    }

    fn check_command_timeout(&mut self) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| Instant::now() >= p.deadline);
        if expired {
            if let Some(pending) = self.pending.take() {
                let _ = pending.reply.send(Err(CommandError::Timeout));
            }
        }
    }

    // ---- line handling -----------------------------------------------------

    fn standard_line_handler(&mut self, channel: u8, line: &str) {
        debug!("rx ch{channel}: {line}");

        let mut finished = false;
        if let Some(pending) = self.pending.as_mut() {
            if pending.channel == channel {
                pending.output.push_str(line);
                pending.output.push('\n');
                finished = is_terminator(line);
            }
        }
        if finished {
            if let Some(pending) = self.pending.take() {
                let _ = pending.reply.send(Ok(pending.output));
            }
        }

        if let Some((regtype, status)) = parse_creg(line) {
            self.set_network_registration(regtype, status);
        } else if let Some(dbm) = parse_csq(line) {
            self.m_sq.set_float(dbm);
            self.m_net_sq.set_float(dbm);
        } else if let Some(provider) = parse_cops(line) {
            if provider != self.provider {
                info!("Network provider: {provider}");
                self.provider = provider;
                self.m_provider.set_string(&self.provider);
                self.m_network.set_string(&self.provider);
            }
        }

        self.state_activity(channel, line);
    }

    fn set_network_registration(&mut self, regtype: RegType, status: NetReg) {
        self.netreg[regtype as usize] = status;
        let best = self.best_netreg();
        if self.m_netreg.set_string(best.label()) {
            info!("Network registration: {}", best.label());
        }
    }

    fn best_netreg(&self) -> NetReg {
        *self.netreg.iter().max().unwrap_or(&NetReg::Unknown)
    }

    // ---- state machine -----------------------------------------------------

    fn set_state(&mut self, new_state: ModemState) {
        let old_state = self.state;
        self.state_leave(old_state);
        if new_state != old_state {
            self.timeout_count = 0;
        }
        info!("State: {old_state} -> {new_state}");
        self.state = new_state;
        self.state_ticker = 0;
        self.timeout_ticks = 0;
        self.timeout_goto = ModemState::None;
        self.state_enter(new_state);
        if let Some(topic) = new_state.event_topic() {
            self.events.signal(topic);
        }
    }

    fn set_timeout(&mut self, ticks: u32, goto: ModemState) {
        self.timeout_ticks = ticks;
        self.timeout_goto = goto;
    }

    fn state_leave(&mut self, old_state: ModemState) {
        if old_state == ModemState::NetSleep {
            let channel = self.driver.channel_cmd();
            self.muxtx(channel, b"AT+CFUN=1\r\n");
        }
    }

    fn state_enter(&mut self, state: ModemState) {
        match state {
            ModemState::None | ModemState::Development => {}
            ModemState::CheckPowerOff => {
                self.port.set_power(false);
                self.last_rx = Instant::now();
                self.set_timeout(30, ModemState::PoweredOff);
            }
            ModemState::PoweringOn => {
                self.port.set_power(true);
                self.set_timeout(30, ModemState::PowerOffOn);
            }
            ModemState::Identify => {
                self.port_write(b"AT\r\nATI\r\n");
                self.set_timeout(10, ModemState::Identify);
            }
            ModemState::PoweredOn => {
                self.port_write(b"AT\r\n");
                self.set_timeout(30, ModemState::PowerOffOn);
            }
            ModemState::MuxStart => {
                self.port_write(b"AT+CMUX=0\r\n");
                self.set_timeout(30, ModemState::PowerOffOn);
            }
            ModemState::NetWait => {
                let gps = self.config.lock().unwrap().modem.enable_gps;
                if gps {
                    let channel = self.driver.channel_cmd();
                    let startup = self.driver.gps_startup();
                    self.muxtx(channel, startup.as_bytes());
                }
            }
            ModemState::NetStart => {
                self.set_timeout(30, ModemState::NetHold);
            }
            ModemState::NetLoss => {
                self.ppp.link_down();
                self.set_timeout(1, ModemState::NetWait);
            }
            ModemState::NetHold | ModemState::NetMode => {}
            ModemState::NetSleep | ModemState::NetDeepSleep => {
                let channel = self.driver.channel_cmd();
                self.muxtx(channel, b"AT+CFUN=0\r\n");
            }
            ModemState::PoweringOff => {
                self.ppp.link_down();
                if self.mux.is_some() {
                    let channel = self.driver.channel_cmd();
                    let shutdown = self.driver.gps_shutdown();
                    self.muxtx(channel, shutdown.as_bytes());
                }
                if let Some(mux) = self.mux.as_mut() {
                    mux.stop();
                }
                self.mux = None;
                let command = self.driver.power_off_command();
                self.port_write(command.as_bytes());
                self.set_timeout(10, ModemState::CheckPowerOff);
            }
            ModemState::PoweredOff => {
                if let Some(mux) = self.mux.as_mut() {
                    mux.stop();
                }
                self.mux = None;
            }
            ModemState::PowerOffOn => {
                self.port.set_power(false);
                if let Some(mux) = self.mux.as_mut() {
                    mux.stop();
                }
                self.mux = None;
                self.set_timeout(3, ModemState::PoweringOn);
            }
        }
    }

    /// Per-line reaction of the current state.
    fn state_activity(&mut self, channel: u8, line: &str) {
        match self.state {
            ModemState::Identify => {
                if let Some(model) = driver::detect(line) {
                    info!("Identified modem: {model}");
                    self.driver = driver::create(model);
                    self.ppp.set_channel(self.driver.channel_data());
                    self.m_model.set_string(model);
                    self.set_state(ModemState::PoweredOn);
                }
            }
            ModemState::PoweredOn => {
                if line == "OK" {
                    self.set_state(ModemState::MuxStart);
                }
            }
            ModemState::MuxStart => {
                if line == "OK" && self.mux.is_none() {
                    let mut mux =
                        Mux::new(self.driver.mux_channels(), self.driver.channel_data());
                    let sabm = mux.start();
                    self.mux = Some(mux);
                    self.port_write(&sabm);
                }
            }
            ModemState::NetStart => {
                if channel == self.driver.channel_data() {
                    if line == "CONNECT" {
                        self.ppp.link_up();
                        self.set_state(ModemState::NetMode);
                    } else if line == "NO CARRIER" || line == "ERROR" || line == "BUSY" {
                        warn!("Data call failed: {line}");
                        self.set_state(ModemState::NetHold);
                    }
                }
            }
            _ => {}
        }
    }

    /// One second tick: timeouts first, then per-state work.
    fn ticker(&mut self) {
        self.state_ticker += 1;

        if self.timeout_ticks > 0 && self.state_ticker >= self.timeout_ticks {
            self.timeout_count += 1;
            if self.timeout_count >= MAX_STATE_TIMEOUTS {
                warn!(
                    "State {} timed out {} times, power cycling",
                    self.state, self.timeout_count
                );
                self.set_state(ModemState::PowerOffOn);
            } else {
                let goto = self.timeout_goto;
                warn!("State {} timeout, going to {goto}", self.state);
                self.set_state(goto);
            }
            return;
        }

        match self.state {
            ModemState::CheckPowerOff => {
                let quiet = self.options.tick_interval * QUIESCENT_TICKS;
                if self.last_rx.elapsed() >= quiet {
                    self.set_state(ModemState::PoweredOff);
                }
            }
            ModemState::PoweringOn => {
                if self.state_ticker >= self.driver.power_pulse_secs() {
                    // a power cycle on an already identified modem skips
                    // re-identification
                    if self.driver.model() == "auto" {
                        self.set_state(ModemState::Identify);
                    } else {
                        self.set_state(ModemState::PoweredOn);
                    }
                }
            }
            ModemState::Identify => {
                if self.state_ticker % 3 == 0 {
                    self.port_write(b"AT\r\nATI\r\n");
                }
            }
            ModemState::PoweredOn => {
                if self.state_ticker % 10 == 0 {
                    self.port_write(b"AT\r\n");
                }
            }
            ModemState::MuxStart => {
                if self.mux.as_ref().is_some_and(Mux::is_mux_up) {
                    self.set_state(ModemState::NetWait);
                }
            }
            ModemState::NetWait => {
                if self.best_netreg().is_registered() {
                    self.set_state(ModemState::NetStart);
                } else if self.state_ticker % 2 == 1 {
                    let channel = self.driver.channel_poll();
                    self.muxtx(channel, b"AT+CREG?;+CGREG?;+CEREG?\r\n");
                }
            }
            ModemState::NetStart => {
                if self.state_ticker == 1 {
                    let channel = self.driver.channel_data();
                    self.muxtx(channel, b"ATD*99#\r\n");
                }
            }
            ModemState::NetMode => {
                if !self.ppp.is_connected() || !self.best_netreg().is_registered() {
                    self.set_state(ModemState::NetLoss);
                } else if self.state_ticker % STATUS_POLL_INTERVAL == 0 {
                    let channel = self.driver.channel_poll();
                    let poll = self.driver.status_poller();
                    self.muxtx(channel, poll.as_bytes());
                }
            }
            ModemState::NetHold | ModemState::NetSleep => {
                if self.state_ticker % STATUS_POLL_INTERVAL == 0 {
                    let channel = self.driver.channel_poll();
                    let poll = self.driver.status_poller();
                    self.muxtx(channel, poll.as_bytes());
                }
            }
            _ => {}
        }
    }

    fn status_report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Modem:     {} ({})\n", self.driver.model(), self.state));
        out.push_str(&format!(
            "Network:   {} ({})\n",
            self.provider,
            self.best_netreg().label()
        ));
        out.push_str(&format!(
            "Signal:    {:.0} dBm\n",
            self.m_sq.as_float()
        ));
        if let Some(mux) = self.mux.as_ref() {
            out.push_str(&format!(
                "Mux:       up={} frames rx={} tx={} err={}\n",
                mux.is_mux_up(),
                mux.rx_frame_count(),
                mux.tx_frame_count(),
                mux.framing_errors()
            ));
        } else {
            out.push_str("Mux:       down\n");
        }
        out.push_str(&format!(
            "PPP:       connected={} rx={} tx={}\n",
            self.ppp.is_connected(),
            self.ppp.rx_bytes(),
            self.ppp.tx_bytes()
        ));
        out.push_str(&format!(
            "IO errors: {}  NMEA checksum errors: {}\n",
            self.io_errors,
            self.nmea.checksum_errors()
        ));
        out
    }
}

fn is_terminator(line: &str) -> bool {
    line == "OK"
        || line == "ERROR"
        || line.starts_with("+CME ERROR")
        || line.starts_with("+CMS ERROR")
}

/// Parse `+CREG` / `+CGREG` / `+CEREG` lines, solicited or unsolicited.
#[must_use]
fn parse_creg(line: &str) -> Option<(RegType, NetReg)> {
    let (regtype, rest) = if let Some(rest) = line.strip_prefix("+CREG:") {
        (RegType::Gsm, rest)
    } else if let Some(rest) = line.strip_prefix("+CGREG:") {
        (RegType::Gprs, rest)
    } else if let Some(rest) = line.strip_prefix("+CEREG:") {
        (RegType::Eps, rest)
    } else {
        return None;
    };

    let fields: Vec<&str> = rest.trim().split(',').map(str::trim).collect();
    // solicited replies carry <n>,<stat>, unsolicited just <stat>
    let stat = if fields.len() >= 2 {
        fields[1]
    } else {
        *fields.first()?
    };
    let status = match stat.parse::<u8>().ok()? {
        0 => NetReg::NotRegistered,
        1 => NetReg::RegisteredHome,
        2 => NetReg::Searching,
        3 => NetReg::DeniedRegistration,
        5 => NetReg::RegisteredRoaming,
        _ => NetReg::Unknown,
    };
    Some((regtype, status))
}

/// Parse `+CSQ: <rssi>,<ber>` into dBm; 99 means unknown.
#[must_use]
fn parse_csq(line: &str) -> Option<f32> {
    let rest = line.strip_prefix("+CSQ:")?.trim();
    let rssi: i32 = rest.split(',').next()?.trim().parse().ok()?;
    if (0..=31).contains(&rssi) {
        Some(-113.0 + 2.0 * rssi as f32)
    } else {
        None
    }
}

/// Parse the operator name out of `+COPS: 0,0,"Name",7`.
#[must_use]
fn parse_cops(line: &str) -> Option<String> {
    let rest = line.strip_prefix("+COPS:")?;
    let start = rest.find('"')? + 1;
    let end = rest[start..].find('"')? + start;
    Some(rest[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creg_parsing() {
        assert_eq!(
            parse_creg("+CREG: 0,1"),
            Some((RegType::Gsm, NetReg::RegisteredHome))
        );
        assert_eq!(
            parse_creg("+CREG: 5"),
            Some((RegType::Gsm, NetReg::RegisteredRoaming))
        );
        assert_eq!(
            parse_creg("+CGREG: 0,2"),
            Some((RegType::Gprs, NetReg::Searching))
        );
        assert_eq!(
            parse_creg("+CEREG: 0,3"),
            Some((RegType::Eps, NetReg::DeniedRegistration))
        );
        assert_eq!(parse_creg("+COPS: 0"), None);
    }

    #[test]
    fn netreg_best_of_ordering() {
        assert!(NetReg::RegisteredHome > NetReg::Searching);
        assert!(NetReg::RegisteredHome.is_registered());
        assert!(NetReg::RegisteredRoaming.is_registered());
        assert!(!NetReg::Searching.is_registered());
        assert!(!NetReg::NotRegistered.is_registered());
    }

    #[test]
    fn csq_to_dbm() {
        assert_eq!(parse_csq("+CSQ: 17,99"), Some(-79.0));
        assert_eq!(parse_csq("+CSQ: 0,0"), Some(-113.0));
        assert_eq!(parse_csq("+CSQ: 31,99"), Some(-51.0));
        assert_eq!(parse_csq("+CSQ: 99,99"), None);
    }

    #[test]
    fn cops_provider() {
        assert_eq!(
            parse_cops("+COPS: 0,0,\"Thing Mobile\",7"),
            Some("Thing Mobile".to_string())
        );
        assert_eq!(parse_cops("+COPS: 0"), None);
    }

    #[test]
    fn terminators() {
        assert!(is_terminator("OK"));
        assert!(is_terminator("ERROR"));
        assert!(is_terminator("+CME ERROR: 10"));
        assert!(!is_terminator("+CREG: 0,1"));
        assert!(!is_terminator("ATI"));
    }
}

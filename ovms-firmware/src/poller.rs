//! Deterministic periodic OBD-II poller.
//!
//! A static table maps each PID to a per-state polling period; a 1 Hz
//! tick schedules due requests with round-robin offsets so the load
//! spreads over time. Requests are single ISO-TP frames; responses are
//! reassembled (single, first + consecutive with flow control) and
//! dispatched to the vehicle decoder exactly once per completed payload.
//!
//! One request is outstanding at a time: the next poll is only sent once
//! the previous one completed or timed out, with the configured response
//! separation time in between.

use atomic_enum::atomic_enum;
use log::{debug, info, warn};
use ovms_isotp_lib::{encode_single, IsotpError, Reassembler, Step};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::can::{CanBus, CanError, CanFrame};
use crate::events::EventBus;
use crate::thread_util;
use crate::vehicle::VehicleDecoder;
use crate::watchdog::WatchdogHandle;

pub use ovms_isotp_lib::Addressing;

/// OBD-II current data request (8-bit PID).
pub const POLL_TYPE_OBDII_CURRENT: u8 = 0x01;
/// OBD-II vehicle information request (8-bit PID).
pub const POLL_TYPE_OBDII_VEHICLE: u8 = 0x09;
/// UDS ReadDataByIdentifier (16-bit PID).
pub const POLL_TYPE_READ_DATA: u8 = 0x22;

/// Service byte of a negative response.
const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Seconds of total CAN silence before the poller shuts down.
const SILENCE_SHUTDOWN_SECS: u32 = 3;

/// Poll reply drought (seconds) that degrades ALIVE/READY to SHUTDOWN.
const REPLY_WINDOW_SECS: u64 = 10;

/// Poller activity state; selects the period column of the poll table.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum PollerState {
    /// No CAN traffic, vehicle is off; nothing is polled.
    Shutdown = 0,
    /// Frames seen, vehicle alive but not ready to drive.
    Alive,
    /// Vehicle energized / being driven.
    Ready,
    /// Battery being charged.
    Charging,
}

impl PollerState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Shutdown => "SHUTDOWN",
            Self::Alive => "ALIVE",
            Self::Ready => "READY",
            Self::Charging => "CHARGING",
        }
    }
}

/// One poll table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    /// CAN id requests are sent to.
    pub tx_id: u32,
    /// CAN id the response arrives on.
    pub rx_id: u32,
    pub poll_type: u8,
    pub pid: u16,
    /// Period in ticks per poller state; 0 disables the entry in that state.
    pub periods: [u16; 4],
    /// Bus number, 1-based.
    pub bus: u8,
    pub addressing: Addressing,
}

/// A completed response handed to the decoder.
pub struct PollReply<'a> {
    pub bus: u8,
    pub tx_id: u32,
    pub rx_id: u32,
    pub poll_type: u8,
    pub pid: u16,
    pub data: &'a [u8],
    /// Bytes still outstanding; always 0 since dispatch happens once the
    /// payload is complete.
    pub remaining: u16,
}

/// Decoder-facing control surface, passed into the callbacks.
pub struct PollerCtl {
    state: PollerState,
    requested: Option<PollerState>,
}

impl PollerCtl {
    #[must_use]
    pub fn new(state: PollerState) -> Self {
        Self {
            state,
            requested: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Request a state change (vendor indicators, e.g. charging).
    pub fn set_state(&mut self, state: PollerState) {
        self.requested = Some(state);
    }

    /// Consume the pending request, if any.
    pub fn take_request(&mut self) -> Option<PollerState> {
        self.requested.take()
    }
}

/// Tuning knobs; tests shrink the timings.
pub struct PollerOptions {
    pub tick_interval: Duration,
    pub io_timeout: Duration,
    /// Abandon a request with no reply at all after this long.
    pub response_timeout: Duration,
    /// Discard a partial multi-frame reply this long after the last frame.
    pub isotp_timeout: Duration,
    /// Maximum queries sent per tick.
    pub throttling: u16,
    /// Gap between completed poll and next request; also the ST byte sent
    /// in flow control frames.
    pub separation_time: Duration,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            io_timeout: Duration::from_millis(50),
            response_timeout: Duration::from_millis(500),
            isotp_timeout: ovms_isotp_lib::DEFAULT_TIMEOUT,
            throttling: 50,
            separation_time: Duration::from_millis(5),
        }
    }
}

/// Requests handled by the poller task.
pub enum PollerRequest {
    SetState(PollerState),
    Pause,
    Resume,
    /// Subscribe a channel to every received frame (RE tools).
    AddTap(Sender<CanFrame>),
    Status { reply: oneshot::Sender<String> },
    Shutdown,
}

/// Cloneable handle to the poller task.
#[derive(Clone)]
pub struct PollerHandle {
    tx: Sender<PollerRequest>,
    state: Arc<AtomicPollerState>,
}

impl PollerHandle {
    #[must_use]
    pub fn state(&self) -> PollerState {
        self.state.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_state(&self, state: PollerState) {
        let _ = self.tx.send(PollerRequest::SetState(state));
    }

    pub fn pause(&self) {
        let _ = self.tx.send(PollerRequest::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(PollerRequest::Resume);
    }

    pub fn add_tap(&self, tap: Sender<CanFrame>) {
        let _ = self.tx.send(PollerRequest::AddTap(tap));
    }

    #[must_use]
    pub fn status(&self) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PollerRequest::Status { reply: reply_tx })
            .is_err()
        {
            return "Poller task not running".to_string();
        }
        reply_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| "Poller task not responding".to_string())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PollerRequest::Shutdown);
    }
}

struct Installed {
    entry: PollEntry,
    offset: u16,
}

struct InFlight {
    index: usize,
    reassembler: Reassembler,
    sent_at: Instant,
}

pub struct Poller {
    bus: Arc<dyn CanBus>,
    vehicle: Box<dyn VehicleDecoder>,
    options: PollerOptions,
    events: Arc<EventBus>,

    table: Vec<Installed>,
    state: Arc<AtomicPollerState>,
    paused: bool,
    tick: u64,
    queue: VecDeque<usize>,
    sent_this_tick: u16,
    in_flight: Option<InFlight>,
    last_poll_done: Instant,

    frames_this_second: u32,
    silent_secs: u32,
    replies_in_window: u32,
    indicators_in_window: u32,

    poll_count: u64,
    reply_count: u64,
    error_count: u64,
    taps: Vec<Sender<CanFrame>>,
}

impl Poller {
    pub fn new(
        bus: Arc<dyn CanBus>,
        vehicle: Box<dyn VehicleDecoder>,
        events: Arc<EventBus>,
        options: PollerOptions,
    ) -> Self {
        let table = install_table(vehicle.poll_table());
        info!(
            "Poller: vehicle {} with {} poll entries",
            vehicle.vehicle_type(),
            table.len()
        );
        Self {
            bus,
            vehicle,
            options,
            events,
            table,
            state: Arc::new(AtomicPollerState::new(PollerState::Shutdown)),
            paused: false,
            tick: 0,
            queue: VecDeque::new(),
            sent_this_tick: 0,
            in_flight: None,
            last_poll_done: Instant::now(),
            frames_this_second: 0,
            silent_secs: 0,
            replies_in_window: 0,
            indicators_in_window: 0,
            poll_count: 0,
            reply_count: 0,
            error_count: 0,
            taps: Vec::new(),
        }
    }

    /// Spawn the poller task and return its control handle.
    pub fn start(self) -> PollerHandle {
        let (tx, rx) = mpsc::channel();
        let state = self.state.clone();
        thread_util::spawn_named("poller", move || self.run(&rx));
        PollerHandle { tx, state }
    }

    fn run(mut self, rx: &Receiver<PollerRequest>) {
        let watchdog = WatchdogHandle::register("poller");
        info!("Poller task started");
        let mut last_tick = Instant::now();

        loop {
            watchdog.feed();

            while let Ok(request) = rx.try_recv() {
                if !self.handle_request(request) {
                    info!("Poller task shutting down");
                    return;
                }
            }

            match self.bus.receive(self.options.io_timeout) {
                Ok(frame) => self.on_frame_rx(&frame),
                Err(CanError::Timeout) => {}
                Err(e) => {
                    debug!("CAN receive error: {e}");
                    std::thread::sleep(self.options.io_timeout);
                }
            }

            self.check_in_flight_timeout();
            self.try_send_next();

            if last_tick.elapsed() >= self.options.tick_interval {
                last_tick = Instant::now();
                self.ticker();
            }
        }
    }

    fn handle_request(&mut self, request: PollerRequest) -> bool {
        match request {
            PollerRequest::SetState(state) => self.change_state(state),
            PollerRequest::Pause => {
                info!("Poller paused");
                self.paused = true;
                self.queue.clear();
            }
            PollerRequest::Resume => {
                info!("Poller resumed");
                self.paused = false;
            }
            PollerRequest::AddTap(tap) => self.taps.push(tap),
            PollerRequest::Status { reply } => {
                let _ = reply.send(self.status_report());
            }
            PollerRequest::Shutdown => return false,
        }
        true
    }

    #[must_use]
    fn current_state(&self) -> PollerState {
        self.state.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn change_state(&mut self, state: PollerState) {
        let old = self.current_state();
        if old == state {
            return;
        }
        info!("Poll state: {} -> {}", old.label(), state.label());
        self.state.store(state, std::sync::atomic::Ordering::Relaxed);
        self.events.signal_with("vehicle.pollstate", vec![state as u8]);
        if state == PollerState::Shutdown {
            self.queue.clear();
            self.in_flight = None;
        }
    }

    /// 10 Hz-ish receive path: traffic accounting, taps, reassembly.
    fn on_frame_rx(&mut self, frame: &CanFrame) {
        self.frames_this_second += 1;
        self.taps.retain(|tap| tap.send(frame.clone()).is_ok());
        self.vehicle.on_frame_rx(frame);
        if self.vehicle.ready_indicator_rx().contains(&frame.id) {
            self.indicators_in_window += 1;
        }

        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        let entry = self.table[in_flight.index].entry;
        if frame.bus != entry.bus || frame.id != entry.rx_id {
            return;
        }

        match in_flight.reassembler.feed(&frame.data) {
            Ok(Step::SendFlowControl(fc)) => {
                let fc_frame = CanFrame {
                    bus: entry.bus,
                    id: entry.tx_id,
                    extended: entry.tx_id > 0x7FF,
                    data: fc,
                };
                if let Err(e) = self.bus.transmit(&fc_frame) {
                    warn!("Flow control transmit failed: {e}");
                }
            }
            Ok(Step::Complete(payload)) => {
                self.in_flight = None;
                self.last_poll_done = Instant::now();
                self.replies_in_window += 1;
                self.reply_count += 1;
                self.dispatch(&entry, &payload);
            }
            Ok(Step::Consumed) => {}
            Err(IsotpError::SequenceGap { expected, got }) => {
                debug!(
                    "ISO-TP sequence gap on {:03x} (expected {expected}, got {got})",
                    entry.rx_id
                );
                self.error_count += 1;
                self.in_flight = None;
                self.last_poll_done = Instant::now();
            }
            Err(e) => {
                debug!("ISO-TP error on {:03x}: {e}", entry.rx_id);
                self.error_count += 1;
            }
        }
    }

    /// Route a completed payload to the decoder callbacks.
    fn dispatch(&mut self, entry: &PollEntry, payload: &[u8]) {
        if payload.first() == Some(&NEGATIVE_RESPONSE) {
            let nrc = payload.get(2).copied().unwrap_or(0);
            debug!(
                "Negative response for type {:02x} pid {:04x}: NRC {nrc:02x}",
                entry.poll_type, entry.pid
            );
            self.vehicle.on_poll_error(entry, nrc);
            return;
        }

        let expected_service = entry.poll_type + 0x40;
        let data = match entry.poll_type {
            POLL_TYPE_READ_DATA => {
                if payload.len() < 3
                    || payload[0] != expected_service
                    || u16::from_be_bytes([payload[1], payload[2]]) != entry.pid
                {
                    debug!("Mismatched response for pid {:04x}", entry.pid);
                    return;
                }
                &payload[3..]
            }
            _ => {
                if payload.len() < 2
                    || payload[0] != expected_service
                    || u16::from(payload[1]) != entry.pid
                {
                    debug!("Mismatched response for pid {:04x}", entry.pid);
                    return;
                }
                &payload[2..]
            }
        };

        let reply = PollReply {
            bus: entry.bus,
            tx_id: entry.tx_id,
            rx_id: entry.rx_id,
            poll_type: entry.poll_type,
            pid: entry.pid,
            data,
            remaining: 0,
        };
        let mut ctl = PollerCtl::new(self.current_state());
        self.vehicle.on_poll_reply(&reply, &mut ctl);
        if let Some(state) = ctl.take_request() {
            self.change_state(state);
        }
    }

    /// Drop an in-flight request that stopped making progress.
    fn check_in_flight_timeout(&mut self) {
        let Some(in_flight) = self.in_flight.as_ref() else {
            return;
        };
        let partial_expired = in_flight.reassembler.is_expired(self.options.isotp_timeout);
        let total_expired = in_flight.sent_at.elapsed() > self.options.response_timeout;
        if partial_expired || total_expired {
            let entry = self.table[in_flight.index].entry;
            debug!(
                "Poll timeout for {:03x} type {:02x} pid {:04x}",
                entry.tx_id, entry.poll_type, entry.pid
            );
            self.in_flight = None;
            self.last_poll_done = Instant::now();
        }
    }

    /// Send the next due request if the line is free.
    fn try_send_next(&mut self) {
        if self.paused
            || self.in_flight.is_some()
            || self.sent_this_tick >= self.options.throttling
            || self.last_poll_done.elapsed() < self.options.separation_time
        {
            return;
        }
        let Some(index) = self.queue.pop_front() else {
            return;
        };
        let entry = self.table[index].entry;
        let Some(request) = encode_request(&entry) else {
            warn!("Unencodable poll entry pid {:04x}", entry.pid);
            return;
        };
        let frame = CanFrame {
            bus: entry.bus,
            id: entry.tx_id,
            extended: entry.tx_id > 0x7FF,
            data: request,
        };
        debug!(
            "Polling {:03x} type {:02x} pid {:04x}",
            entry.tx_id, entry.poll_type, entry.pid
        );
        match self.bus.transmit(&frame) {
            Ok(()) => {
                self.sent_this_tick += 1;
                self.poll_count += 1;
                self.in_flight = Some(InFlight {
                    index,
                    reassembler: Reassembler::new(
                        entry.addressing,
                        self.options.separation_time.as_millis() as u8,
                    ),
                    sent_at: Instant::now(),
                });
            }
            Err(e) => {
                debug!("Poll transmit failed: {e}");
                self.error_count += 1;
            }
        }
    }

    /// 1 Hz work: activity heuristics, scheduling, decoder ticks.
    fn ticker(&mut self) {
        self.tick += 1;
        self.sent_this_tick = 0;

        // traffic heuristics
        if self.frames_this_second > 0 {
            if self.current_state() == PollerState::Shutdown {
                info!("CAN traffic seen, waking poller");
                self.change_state(PollerState::Alive);
            }
            self.silent_secs = 0;
        } else {
            self.silent_secs += 1;
            if self.silent_secs >= SILENCE_SHUTDOWN_SECS
                && self.current_state() != PollerState::Shutdown
            {
                info!("No CAN traffic for {}s, poller shutdown", self.silent_secs);
                self.change_state(PollerState::Shutdown);
            }
        }
        self.frames_this_second = 0;

        let mut ctl = PollerCtl::new(self.current_state());
        self.vehicle.on_ticker_1(&mut ctl);

        if self.tick % REPLY_WINDOW_SECS == 0 {
            let state = self.current_state();
            if self.indicators_in_window > 0 {
                if state == PollerState::Alive {
                    info!("Ready indicators seen, vehicle is ON");
                    self.change_state(PollerState::Ready);
                }
            } else if state == PollerState::Ready {
                info!("Ready indicators gone, vehicle is OFF");
                self.change_state(PollerState::Alive);
            }
            self.indicators_in_window = 0;

            if self.replies_in_window == 0
                && matches!(self.current_state(), PollerState::Alive | PollerState::Ready)
            {
                info!("No poll replies for {REPLY_WINDOW_SECS}s, poller shutdown");
                self.change_state(PollerState::Shutdown);
            }
            self.replies_in_window = 0;

            ctl.state = self.current_state();
            self.vehicle.on_ticker_10(&mut ctl);
        }
        if let Some(state) = ctl.take_request() {
            self.change_state(state);
        }

        // schedule due entries
        if self.paused || self.current_state() == PollerState::Shutdown {
            return;
        }
        let column = self.current_state() as usize;
        for (index, installed) in self.table.iter().enumerate() {
            let period = installed.entry.periods[column];
            if period == 0 {
                continue;
            }
            if entry_due(self.tick, installed.offset, period) && !self.queue.contains(&index) {
                self.queue.push_back(index);
            }
        }
    }

    fn status_report(&self) -> String {
        format!(
            "Vehicle:  {}\nState:    {}{}\nTable:    {} entries, {} queued\nCounters: {} polls, {} replies, {} errors\n",
            self.vehicle.vehicle_type(),
            self.current_state().label(),
            if self.paused { " (paused)" } else { "" },
            self.table.len(),
            self.queue.len(),
            self.poll_count,
            self.reply_count,
            self.error_count,
        )
    }
}

/// Assign spreading offsets round-robin over the table.
fn install_table(entries: &[PollEntry]) -> Vec<Installed> {
    entries
        .iter()
        .enumerate()
        .map(|(index, &entry)| Installed {
            entry,
            offset: index as u16,
        })
        .collect()
}

/// Due when `(tick - offset) mod period == 0`.
#[must_use]
fn entry_due(tick: u64, offset: u16, period: u16) -> bool {
    let period = u64::from(period);
    let offset = u64::from(offset) % period;
    (tick + period - offset) % period == 0
}

/// Build the single-frame request for one entry.
#[must_use]
fn encode_request(entry: &PollEntry) -> Option<crate::can::CanData> {
    match entry.poll_type {
        POLL_TYPE_READ_DATA => encode_single(
            entry.addressing,
            &[
                entry.poll_type,
                (entry.pid >> 8) as u8,
                (entry.pid & 0xFF) as u8,
            ],
        ),
        _ => encode_single(entry.addressing, &[entry.poll_type, entry.pid as u8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_schedule_matches_offset_and_period() {
        // period 10, offset 3: fires at 3, 13, 23, ...
        for tick in 0..40u64 {
            let due = entry_due(tick, 3, 10);
            assert_eq!(due, tick % 10 == 3, "tick {tick}");
        }
        // offset larger than period wraps
        assert!(entry_due(2, 12, 10));
    }

    #[test]
    fn request_encoding() {
        let entry = PollEntry {
            tx_id: 0x6F1,
            rx_id: 0x607,
            poll_type: POLL_TYPE_READ_DATA,
            pid: 0xDDBC,
            periods: [0, 10, 10, 10],
            bus: 1,
            addressing: Addressing::Standard,
        };
        let request = encode_request(&entry).unwrap();
        assert_eq!(&request[..4], &[0x03, 0x22, 0xDD, 0xBC]);

        let obd = PollEntry {
            poll_type: POLL_TYPE_OBDII_CURRENT,
            pid: 0x0C,
            ..entry
        };
        let request = encode_request(&obd).unwrap();
        assert_eq!(&request[..3], &[0x02, 0x01, 0x0C]);
    }

    #[test]
    fn offsets_assigned_round_robin() {
        let entry = PollEntry {
            tx_id: 0x700,
            rx_id: 0x708,
            poll_type: POLL_TYPE_READ_DATA,
            pid: 1,
            periods: [0, 10, 10, 10],
            bus: 1,
            addressing: Addressing::Standard,
        };
        let table = install_table(&[entry, entry, entry]);
        let offsets: Vec<u16> = table.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }
}

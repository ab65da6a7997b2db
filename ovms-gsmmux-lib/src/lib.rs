//! GSM 07.10 basic-mode multiplexer for cellular modems.
//!
//! A single serial link is split into numbered logical channels (DLCIs).
//! Channel 0 is the control channel and must be established first; data
//! channels cascade open after it. Frames are SOF-delimited with an 8-bit
//! FCS over the header bytes only:
//!
//! ```text
//! F9 | address | control | length (1-2 bytes, EA) | info | FCS | F9
//! ```
//!
//! The mux owns its channels and their receive buffers. Encoding methods
//! return the bytes to put on the wire; [`Mux::process`] consumes received
//! bytes and reports what happened through [`MuxEvent`]s plus any frames
//! that must be transmitted in response (the channel-open cascade).

use log::{info, warn};
use ovms_buffer_lib::Buffer;

pub mod fcs;

/// Start/end-of-frame delimiter.
pub const SOF: u8 = 0xF9;

/// Extension bit: last byte of an EA-terminated field.
pub const EA: u8 = 0x01;
/// Command/response bit in the address field.
pub const CR: u8 = 0x02;
/// Poll/final bit in the control field.
pub const PF: u8 = 0x10;

/// Set Asynchronous Balanced Mode: open a channel.
pub const SABM: u8 = 0x2F;
/// Disconnect: close a channel.
pub const DISC: u8 = 0x43;
/// Disconnected mode response.
pub const DM: u8 = 0x0F;
/// Unnumbered acknowledgement.
pub const UA: u8 = 0x63;
/// Unnumbered information with header check.
pub const UIH: u8 = 0xEF;

/// Default maximum frame size in bytes (SOF to SOF inclusive).
pub const DEFAULT_MAX_FRAME: usize = 2048;

/// Receive buffer size for the control channel.
const CTRL_BUFFER_SIZE: usize = 8;
/// Receive buffer size for the bulk data channel.
const DATA_BUFFER_SIZE: usize = 2048;
/// Receive buffer size for every other channel.
const CHAN_BUFFER_SIZE: usize = 512;

/// Lifecycle of a single DLCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// DLCI closed.
    Closed,
    /// SABM sent, awaiting UA.
    Opening,
    /// SABM sent, UA received.
    Open,
    /// DISC sent, awaiting UA/DM.
    Closing,
}

/// One logical channel within the mux.
pub struct MuxChannel {
    pub state: ChannelState,
    pub channel: u8,
    pub buffer: Buffer,
}

impl MuxChannel {
    fn new(channel: u8, buffer_size: usize) -> Self {
        Self {
            state: ChannelState::Closed,
            channel,
            buffer: Buffer::new(buffer_size),
        }
    }
}

/// Things that happened while processing received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    /// A channel finished opening (UA received).
    ChannelOpen(u8),
    /// All data channels are now open.
    MuxUp,
    /// New payload bytes were appended to this channel's buffer.
    Incoming(u8),
}

/// The multiplexer: framer state plus channel collection.
pub struct Mux {
    state: ChannelState,
    channels: Vec<MuxChannel>,
    channel_count: u8,
    data_channel: u8,

    frame: Vec<u8>,
    frame_size: usize,
    frame_pos: usize,
    frame_ipos: usize,
    frame_len: usize,
    frame_more_len: bool,

    open_channels: usize,
    framing_errors: u32,
    rx_frame_count: u32,
    tx_frame_count: u32,
    last_good_rx_frame: Option<std::time::Instant>,
}

impl Mux {
    /// Create a mux with `channel_count` data channels (numbered 1..=count)
    /// plus the control channel 0. `data_channel` selects which channel
    /// gets the large receive buffer.
    #[must_use]
    pub fn new(channel_count: u8, data_channel: u8) -> Self {
        Self::with_max_frame(channel_count, data_channel, DEFAULT_MAX_FRAME)
    }

    #[must_use]
    pub fn with_max_frame(channel_count: u8, data_channel: u8, max_frame: usize) -> Self {
        Self {
            state: ChannelState::Closed,
            channels: Vec::new(),
            channel_count,
            data_channel,
            frame: vec![0u8; max_frame],
            frame_size: max_frame,
            frame_pos: 0,
            frame_ipos: 0,
            frame_len: 0,
            frame_more_len: false,
            open_channels: 0,
            framing_errors: 0,
            rx_frame_count: 0,
            tx_frame_count: 0,
            last_good_rx_frame: None,
        }
    }

    /// Begin mux establishment: create the channels and return the SABM
    /// frame opening channel 0. The remaining channels cascade open as UA
    /// responses arrive in [`Mux::process`].
    pub fn start(&mut self) -> Vec<u8> {
        info!("Start MUX");
        self.reset_counters();
        self.channels.clear();
        self.channels.push(MuxChannel::new(0, CTRL_BUFFER_SIZE));
        for k in 1..=self.channel_count {
            let size = if k == self.data_channel {
                DATA_BUFFER_SIZE
            } else {
                CHAN_BUFFER_SIZE
            };
            self.channels.push(MuxChannel::new(k, size));
        }
        let sabm = self.start_channel(0);
        self.state = ChannelState::Opening;
        sabm
    }

    /// Tear the whole mux down. No DISC courtesy is attempted; the modem
    /// side drops all DLCIs when the physical link leaves mux mode.
    pub fn stop(&mut self) {
        info!("Stop MUX");
        self.channels.clear();
        self.state = ChannelState::Closed;
        self.reset_frame();
        self.reset_counters();
    }

    fn reset_counters(&mut self) {
        self.open_channels = 0;
        self.framing_errors = 0;
        self.rx_frame_count = 0;
        self.tx_frame_count = 0;
        self.last_good_rx_frame = None;
    }

    fn reset_frame(&mut self) {
        self.frame_pos = 0;
        self.frame_ipos = 0;
        self.frame_len = 0;
        self.frame_more_len = false;
    }

    /// Send SABM with the poll bit on `channel` and mark it opening.
    pub fn start_channel(&mut self, channel: u8) -> Vec<u8> {
        let addr = (channel << 2) | EA | CR;
        let mut sabm = vec![SOF, addr, SABM + PF, EA, 0x00, SOF];
        let fcs_pos = sabm.len() - 2;
        sabm[fcs_pos] = fcs::calc(&sabm[1..fcs_pos]);
        if let Some(chan) = self.channels.get_mut(channel as usize) {
            chan.state = ChannelState::Opening;
        }
        self.tx_frame_count += 1;
        sabm
    }

    /// Courtesy DISC for one channel. Not required for correctness;
    /// [`Mux::stop`] is the preferred teardown.
    pub fn stop_channel(&mut self, channel: u8) -> Vec<u8> {
        let addr = (channel << 2) | EA | CR;
        let mut disc = vec![SOF, addr, DISC + PF, EA, 0x00, SOF];
        let fcs_pos = disc.len() - 2;
        disc[fcs_pos] = fcs::calc(&disc[1..fcs_pos]);
        if let Some(chan) = self.channels.get_mut(channel as usize) {
            chan.state = ChannelState::Closing;
        }
        self.tx_frame_count += 1;
        disc
    }

    /// Encode `info` as a UIH frame on `channel` and return the wire bytes.
    pub fn tx(&mut self, channel: u8, info: &[u8]) -> Vec<u8> {
        let size = info.len();
        let mut buf = Vec::with_capacity(size + 7);
        buf.push(SOF);
        buf.push((channel << 2) | EA);
        buf.push(UIH + PF);
        if size < 128 {
            buf.push(((size as u8) << 1) | EA);
        } else {
            buf.push((((size % 128) as u8) << 1) & 0xFE);
            buf.push((size / 128) as u8);
        }
        let ipos = buf.len();
        buf.extend_from_slice(info);
        buf.push(fcs::calc(&buf[1..ipos]));
        buf.push(SOF);
        self.tx_frame_count += 1;
        buf
    }

    #[must_use]
    pub fn is_channel_open(&self, channel: u8) -> bool {
        self.channels
            .get(channel as usize)
            .is_some_and(|c| c.state == ChannelState::Open)
    }

    /// True once every data channel reports open.
    #[must_use]
    pub fn is_mux_up(&self) -> bool {
        self.open_channels == self.channel_count as usize
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Mutable access to one channel's receive buffer.
    pub fn channel_buffer(&mut self, channel: u8) -> Option<&mut Buffer> {
        self.channels.get_mut(channel as usize).map(|c| &mut c.buffer)
    }

    #[must_use]
    pub fn framing_errors(&self) -> u32 {
        self.framing_errors
    }

    #[must_use]
    pub fn rx_frame_count(&self) -> u32 {
        self.rx_frame_count
    }

    #[must_use]
    pub fn tx_frame_count(&self) -> u32 {
        self.tx_frame_count
    }

    /// Instant of the last frame that passed FCS verification.
    #[must_use]
    pub fn last_good_rx_frame(&self) -> Option<std::time::Instant> {
        self.last_good_rx_frame
    }

    /// Consume received bytes from `rx`. Frames that must be sent in
    /// response (the open cascade) are appended to `tx_out`; state changes
    /// and payload arrivals are appended to `events`.
    pub fn process(
        &mut self,
        rx: &mut Buffer,
        tx_out: &mut Vec<u8>,
        events: &mut Vec<MuxEvent>,
    ) {
        loop {
            if self.frame_pos == self.frame_size {
                // Overflow frame
                warn!("Frame overflow ({} bytes)", self.frame_size);
                self.reset_frame();
                self.framing_errors += 1;
            }
            let Some(b) = rx.pop() else {
                break;
            };
            if self.frame_pos == 0 && b != SOF {
                continue; // Skip to start of frame
            }
            if self.frame_pos == 1 && b == SOF {
                continue; // End of previous frame, skip it
            }
            self.frame[self.frame_pos] = b;
            self.frame_pos += 1;
            if self.frame_pos == 4 {
                // First byte of the length field
                self.frame_more_len = (b & EA) == 0;
                self.frame_len = (b >> 1) as usize;
                if self.frame_more_len {
                    self.frame_len += self.frame_pos + 3;
                    self.frame_ipos = self.frame_pos + 1;
                } else {
                    self.frame_len += self.frame_pos + 2;
                    self.frame_ipos = self.frame_pos;
                }
            } else if self.frame_pos == 5 && self.frame_more_len {
                // Second byte of the length field
                self.frame_len += (b as usize) << 7;
                self.frame_more_len = false;
            }
            if self.frame_len > 0 && self.frame_len > self.frame_size {
                warn!("Frame length {} exceeds maximum {}", self.frame_len, self.frame_size);
                self.reset_frame();
                self.framing_errors += 1;
                continue;
            }
            if self.frame_pos > 4 && self.frame_pos == self.frame_len {
                if b == SOF {
                    self.process_frame(tx_out, events);
                } else {
                    let channel = self.frame[1] >> 2;
                    warn!(
                        "Frame error: EOF mismatch (CHAN={} ADDR={:02x} CTRL={:02x} LEN={})",
                        channel, self.frame[1], self.frame[2], self.frame_len
                    );
                    self.reset_frame();
                    self.framing_errors += 1;
                }
            }
        }
    }

    fn process_frame(&mut self, tx_out: &mut Vec<u8>, events: &mut Vec<MuxEvent>) {
        let channel = self.frame[1] >> 2;
        let expected = 0xFF - fcs::add_block(fcs::INIT, &self.frame[1..self.frame_ipos]);
        let received = self.frame[self.frame_len - 2];
        if expected != received {
            warn!("FCS mismatch ({expected:02x} != {received:02x})");
            self.reset_frame();
            self.framing_errors += 1;
            return;
        }

        if (channel as usize) < self.channels.len() {
            self.last_good_rx_frame = Some(std::time::Instant::now());
            self.rx_frame_count += 1;
            self.channel_frame(channel, tx_out, events);
        } else {
            warn!("Incoming frame for unrecognised channel #{channel}");
        }
        self.reset_frame();
    }

    /// Per-channel reaction to a verified frame. Payload boundaries within
    /// `self.frame`: control at index 2, info at `frame_ipos..frame_len-2`.
    fn channel_frame(&mut self, channel: u8, tx_out: &mut Vec<u8>, events: &mut Vec<MuxEvent>) {
        let control = self.frame[2];
        let state = self.channels[channel as usize].state;
        match state {
            ChannelState::Closed | ChannelState::Closing => {}
            ChannelState::Opening => {
                if control == UA + PF {
                    info!("Channel #{channel} is open");
                    self.channels[channel as usize].state = ChannelState::Open;
                    if channel != 0 {
                        self.open_channels += 1;
                    } else {
                        self.state = ChannelState::Open;
                    }
                    events.push(MuxEvent::ChannelOpen(channel));
                    if self.is_mux_up() {
                        events.push(MuxEvent::MuxUp);
                    }
                    if channel < self.channel_count {
                        let sabm = self.start_channel(channel + 1);
                        tx_out.extend_from_slice(&sabm);
                    }
                }
                if control == UIH + PF {
                    self.push_info(channel, events);
                }
            }
            ChannelState::Open => {
                if control == UIH + PF {
                    self.push_info(channel, events);
                }
            }
        }
    }

    fn push_info(&mut self, channel: u8, events: &mut Vec<MuxEvent>) {
        let info_start = self.frame_ipos;
        let info_end = self.frame_len - 2;
        let chan = &mut self.channels[channel as usize];
        let mut dropped = false;
        for k in info_start..info_end {
            if chan.buffer.push(self.frame[k]).is_err() {
                dropped = true;
            }
        }
        if dropped {
            warn!("Channel #{channel} buffer full, payload dropped");
        }
        events.push(MuxEvent::Incoming(channel));
    }
}

//! ISO 15765-2 (ISO-TP) transport over CAN.
//!
//! Diagnostic payloads up to 4095 bytes are carried in single frames or
//! split into a first frame plus consecutive frames with a cycling 4-bit
//! sequence counter. The receiver answers a first frame with a flow
//! control frame before the sender continues.
//!
//! Both normal addressing (PCI in byte 0) and extended addressing (target
//! address in byte 0, PCI in byte 1) are supported; the extended scheme is
//! what gateway-fronted ECUs use.

use derive_more::{Display, Error};
use log::debug;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Largest payload a 12-bit first-frame length field can announce.
pub const MAX_PAYLOAD: usize = 4095;

/// Default reassembly timeout since the last received frame.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Frame type nibble values.
pub const FT_SINGLE: u8 = 0;
pub const FT_FIRST: u8 = 1;
pub const FT_CONSECUTIVE: u8 = 2;
pub const FT_FLOWCTRL: u8 = 3;

/// A CAN data field: up to 8 bytes.
pub type CanData = SmallVec<[u8; 8]>;

/// ISO-TP addressing scheme for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// PCI byte first; 7 data bytes in a single frame.
    Standard,
    /// Extended address byte first, then PCI; one data byte fewer per frame.
    Extended {
        /// Target/source address placed in byte 0 of every frame.
        address: u8,
    },
}

impl Addressing {
    /// Byte offset of the PCI nibble within the CAN data field.
    #[must_use]
    pub fn pci_offset(self) -> usize {
        match self {
            Addressing::Standard => 0,
            Addressing::Extended { .. } => 1,
        }
    }
}

/// Errors raised while reassembling a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum IsotpError {
    /// Payload exceeds the 12-bit length field.
    #[display("payload larger than {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,
    /// A consecutive frame arrived with the wrong sequence number.
    #[display("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u8, got: u8 },
    /// A consecutive frame arrived with no reassembly in progress.
    #[display("unexpected consecutive frame")]
    UnexpectedConsecutive,
    /// Frame too short to carry its declared content.
    #[display("truncated frame")]
    Truncated,
}

/// What a fed frame produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Frame consumed, more to come.
    Consumed,
    /// A complete payload is available.
    Complete(Vec<u8>),
    /// A first frame was accepted; send this flow control frame back.
    SendFlowControl(CanData),
}

/// Build a single-frame request (the only shape the poller transmits).
/// Returns `None` if the payload does not fit one frame.
#[must_use]
pub fn encode_single(addressing: Addressing, payload: &[u8]) -> Option<CanData> {
    let offset = addressing.pci_offset();
    if payload.len() > 7 - offset {
        return None;
    }
    let mut data = CanData::new();
    if let Addressing::Extended { address } = addressing {
        data.push(address);
    }
    data.push(((FT_SINGLE) << 4) | payload.len() as u8);
    data.extend_from_slice(payload);
    // pad to a full 8-byte frame as ECUs expect
    while data.len() < 8 {
        data.push(0);
    }
    Some(data)
}

/// Build the flow control frame answering a first frame:
/// continue-to-send, `block_size` 0 = unlimited, `st` separation time (ms).
#[must_use]
pub fn encode_flow_control(addressing: Addressing, block_size: u8, st: u8) -> CanData {
    let mut data = CanData::new();
    if let Addressing::Extended { address } = addressing {
        data.push(address);
    }
    data.push(FT_FLOWCTRL << 4);
    data.push(block_size);
    data.push(st);
    while data.len() < 8 {
        data.push(0);
    }
    data
}

/// Split a payload into the frame sequence a sending ECU would emit.
/// Used by tests and the mock ECU side; the module itself only receives
/// multi-frame payloads.
pub fn segment(addressing: Addressing, payload: &[u8]) -> Result<Vec<CanData>, IsotpError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(IsotpError::PayloadTooLarge);
    }
    let offset = addressing.pci_offset();
    if payload.len() <= 7 - offset {
        return Ok(vec![encode_single(addressing, payload).unwrap()]);
    }

    let mut frames = Vec::new();
    let mut first = CanData::new();
    if let Addressing::Extended { address } = addressing {
        first.push(address);
    }
    first.push((FT_FIRST << 4) | ((payload.len() >> 8) as u8 & 0x0F));
    first.push((payload.len() & 0xFF) as u8);
    let first_data = 8 - first.len();
    first.extend_from_slice(&payload[..first_data]);
    frames.push(first);

    let mut sent = first_data;
    let mut seq = 1u8;
    while sent < payload.len() {
        let mut cf = CanData::new();
        if let Addressing::Extended { address } = addressing {
            cf.push(address);
        }
        cf.push((FT_CONSECUTIVE << 4) | seq);
        let room = 8 - cf.len();
        let take = room.min(payload.len() - sent);
        cf.extend_from_slice(&payload[sent..sent + take]);
        while cf.len() < 8 {
            cf.push(0);
        }
        frames.push(cf);
        sent += take;
        seq = (seq + 1) & 0x0F;
    }
    Ok(frames)
}

/// Per-(bus, rx id) reassembly state.
///
/// Created fresh when a poll request is sent; fed every frame arriving on
/// the expected id; discarded on completion or expiry.
pub struct Reassembler {
    addressing: Addressing,
    flow_control_st: u8,
    expected: usize,
    buf: Vec<u8>,
    sequence: u8,
    frame_index: u16,
    last_frame: Instant,
    in_progress: bool,
}

impl Reassembler {
    #[must_use]
    pub fn new(addressing: Addressing, flow_control_st: u8) -> Self {
        Self {
            addressing,
            flow_control_st,
            expected: 0,
            buf: Vec::new(),
            sequence: 0,
            frame_index: 0,
            last_frame: Instant::now(),
            in_progress: false,
        }
    }

    /// Bytes still outstanding after the most recent frame.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.buf.len())
    }

    /// Number of frames consumed so far in the current reassembly.
    #[must_use]
    pub fn frame_index(&self) -> u16 {
        self.frame_index
    }

    /// True if a multi-frame reassembly is underway and the last frame is
    /// older than `timeout`.
    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.in_progress && self.last_frame.elapsed() > timeout
    }

    /// Drop any partial payload.
    pub fn reset(&mut self) {
        self.expected = 0;
        self.buf.clear();
        self.sequence = 0;
        self.frame_index = 0;
        self.in_progress = false;
    }

    /// Feed one received CAN data field.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step, IsotpError> {
        let offset = self.addressing.pci_offset();
        if data.len() <= offset {
            return Err(IsotpError::Truncated);
        }
        let pci = data[offset];
        self.last_frame = Instant::now();
        match pci >> 4 {
            FT_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if data.len() < offset + 1 + len {
                    return Err(IsotpError::Truncated);
                }
                self.reset();
                self.frame_index = 1;
                Ok(Step::Complete(data[offset + 1..offset + 1 + len].to_vec()))
            }
            FT_FIRST => {
                if data.len() < offset + 2 {
                    return Err(IsotpError::Truncated);
                }
                self.reset();
                self.expected =
                    (((pci & 0x0F) as usize) << 8) | data[offset + 1] as usize;
                self.buf.extend_from_slice(&data[offset + 2..]);
                self.sequence = 1;
                self.frame_index = 1;
                self.in_progress = true;
                debug!("first frame: expecting {} bytes", self.expected);
                Ok(Step::SendFlowControl(encode_flow_control(
                    self.addressing,
                    0,
                    self.flow_control_st,
                )))
            }
            FT_CONSECUTIVE => {
                if !self.in_progress {
                    return Err(IsotpError::UnexpectedConsecutive);
                }
                let seq = pci & 0x0F;
                if seq != self.sequence {
                    let expected = self.sequence;
                    self.reset();
                    return Err(IsotpError::SequenceGap { expected, got: seq });
                }
                self.sequence = (self.sequence + 1) & 0x0F;
                self.frame_index += 1;
                let take = (data.len() - offset - 1).min(self.remaining());
                self.buf
                    .extend_from_slice(&data[offset + 1..offset + 1 + take]);
                if self.buf.len() >= self.expected {
                    let payload = std::mem::take(&mut self.buf);
                    self.reset();
                    Ok(Step::Complete(payload))
                } else {
                    Ok(Step::Consumed)
                }
            }
            _ => Ok(Step::Consumed), // flow control towards us: ignore
        }
    }
}

//! CAN bus abstraction and the CRTD text bridge.
//!
//! The concrete controller (TWAI peripheral, SocketCAN, a TCP bridge) is a
//! collaborator behind the [`CanBus`] trait; the poller and the RE tools
//! only see frames. The CRTD codec carries frames as text lines over TCP
//! for development and capture replay:
//!
//! ```text
//! 1553594667.563 1R11 100 01 02 03
//! ^timestamp     ^bus, direction (R/T), id bits (11/29), then id and data in hex
//! ```

use log::debug;
use ovms_buffer_lib::{Buffer, BufferError};
use smallvec::SmallVec;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A CAN data field: up to 8 bytes.
pub type CanData = SmallVec<[u8; 8]>;

/// One CAN frame, tagged with the bus it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Bus number, 1-based.
    pub bus: u8,
    /// 11- or 29-bit identifier.
    pub id: u32,
    /// True for a 29-bit identifier.
    pub extended: bool,
    pub data: CanData,
}

impl CanFrame {
    #[must_use]
    pub fn new(bus: u8, id: u32, extended: bool, data: &[u8]) -> Self {
        Self {
            bus,
            id,
            extended,
            data: CanData::from_slice(data),
        }
    }
}

/// Errors from the CAN transport.
#[derive(Debug, Clone)]
pub enum CanError {
    /// No frame arrived within the timeout.
    Timeout,
    /// The transport is gone (bus off, bridge disconnected).
    Disconnected,
    IoError(String),
}

impl std::fmt::Display for CanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "CAN receive timeout"),
            Self::Disconnected => write!(f, "CAN transport disconnected"),
            Self::IoError(e) => write!(f, "CAN IO error: {e}"),
        }
    }
}

impl std::error::Error for CanError {}

/// A CAN controller the poller can drive.
pub trait CanBus: Send + Sync {
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanError>;
    /// Block up to `timeout` for the next frame.
    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError>;
}

/// Render a frame as one CRTD line (no trailing newline).
#[must_use]
pub fn format_crtd(frame: &CanFrame, timestamp: Duration, transmitted: bool) -> String {
    let mut line = format!(
        "{}.{:03} {}{}{} {:x}",
        timestamp.as_secs(),
        timestamp.subsec_millis(),
        frame.bus,
        if transmitted { 'T' } else { 'R' },
        if frame.extended { "29" } else { "11" },
        frame.id
    );
    for b in &frame.data {
        line.push_str(&format!(" {b:02x}"));
    }
    line
}

/// Parse one CRTD line. Comment and unknown record types yield `None`.
#[must_use]
pub fn parse_crtd(line: &str) -> Option<CanFrame> {
    let mut fields = line.split_ascii_whitespace();
    let _timestamp = fields.next()?;
    let rectype = fields.next()?;

    let bus_end = rectype.find(|c| c == 'R' || c == 'T')?;
    let bus: u8 = rectype[..bus_end].parse().ok()?;
    let extended = match &rectype[bus_end + 1..] {
        "11" => false,
        "29" => true,
        _ => return None,
    };

    let id = u32::from_str_radix(fields.next()?, 16).ok()?;
    let mut data = CanData::new();
    for field in fields {
        if data.len() == 8 {
            return None;
        }
        data.push(u8::from_str_radix(field, 16).ok()?);
    }
    Some(CanFrame {
        bus,
        id,
        extended,
        data,
    })
}

/// CAN over a TCP bridge speaking CRTD lines, one frame per line.
pub struct CrtdTcpBus {
    inner: Mutex<CrtdInner>,
    started: Instant,
}

struct CrtdInner {
    sock: TcpStream,
    rxbuf: Buffer,
}

impl CrtdTcpBus {
    pub fn connect(addr: &str) -> Result<Self, CanError> {
        debug!("Connecting CRTD bridge at {addr}");
        let sock = TcpStream::connect(addr).map_err(|e| CanError::IoError(e.to_string()))?;
        sock.set_nodelay(true).ok();
        Ok(Self {
            inner: Mutex::new(CrtdInner {
                sock,
                rxbuf: Buffer::new(4096),
            }),
            started: Instant::now(),
        })
    }
}

impl CanBus for CrtdTcpBus {
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanError> {
        let line = format_crtd(frame, self.started.elapsed(), true);
        let mut inner = self.inner.lock().unwrap();
        inner
            .sock
            .write_all(line.as_bytes())
            .and_then(|()| inner.sock.write_all(b"\n"))
            .map_err(|e| CanError::IoError(e.to_string()))
    }

    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            while let Some(line) = inner.rxbuf.read_line() {
                if line.is_empty() {
                    continue;
                }
                match parse_crtd(&line) {
                    Some(frame) => return Ok(frame),
                    None => debug!("Ignoring CRTD line {line:?}"),
                }
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(CanError::Timeout)?;
            let CrtdInner { sock, rxbuf } = &mut *inner;
            match rxbuf.poll_socket(sock, remaining) {
                Ok(_) => {}
                Err(BufferError::Timeout) => return Err(CanError::Timeout),
                Err(BufferError::Disconnected) => return Err(CanError::Disconnected),
                Err(BufferError::NoSpace) => {
                    // parser will drain on the next loop pass
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crtd_roundtrip() {
        let frame = CanFrame::new(1, 0x100, false, &[0x01, 0x02, 0x03]);
        let line = format_crtd(&frame, Duration::from_millis(1_500), false);
        assert_eq!(line, "1.500 1R11 100 01 02 03");
        assert_eq!(parse_crtd(&line), Some(frame));
    }

    #[test]
    fn crtd_extended_tx() {
        let frame = CanFrame::new(2, 0x18DB33F1, true, &[0xAA]);
        let line = format_crtd(&frame, Duration::from_secs(10), true);
        assert!(line.contains("2T29 18db33f1 aa"));
        let parsed = parse_crtd(&line).unwrap();
        assert!(parsed.extended);
        assert_eq!(parsed.id, 0x18DB_33F1);
    }

    #[test]
    fn crtd_rejects_garbage() {
        assert_eq!(parse_crtd(""), None);
        assert_eq!(parse_crtd("# comment line"), None);
        assert_eq!(parse_crtd("1.0 1X11 100"), None);
        assert_eq!(parse_crtd("1.0 1R13 100"), None);
        assert_eq!(
            parse_crtd("1.0 1R11 100 01 02 03 04 05 06 07 08 09"),
            None
        );
    }

    #[test]
    fn crtd_empty_data() {
        let frame = CanFrame::new(1, 0x7DF, false, &[]);
        let line = format_crtd(&frame, Duration::ZERO, false);
        assert_eq!(parse_crtd(&line), Some(frame));
    }
}

//! Vehicle monitor module core.
//!
//! The engineering core of the telemetry module: a cellular modem driver
//! with GSM 07.10 multiplexing, NMEA and PPP on top, a Wi-Fi
//! station/AP controller with scan-and-bind roaming, and a deterministic
//! OBD-II poller feeding per-vehicle decoders. Telemetry flows into the
//! metric registry; subsystems coordinate over the event bus.
//!
//! Hardware access (UART, CAN controller, Wi-Fi radio) sits behind traits
//! so the whole core builds and tests on the host.

pub mod can;
pub mod config;
pub mod events;
pub mod metrics;
pub mod modem;
pub mod poller;
pub mod re;
pub mod shell;
pub mod thread_util;
pub mod vehicle;
pub mod watchdog;
pub mod wifi;

use std::sync::OnceLock;
use std::time::Instant;

/// Seconds since process start; the shared monotonic clock for staleness
/// and reconnect deadlines.
#[must_use]
pub fn monotonic_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

//! Point-to-point IP link over the mux data channel.
//!
//! The IP stack itself is an external collaborator behind [`NetStack`]:
//! this layer owns the link lifecycle and pumps bytes between the data
//! channel and the stack, counting traffic as it goes. The modem state
//! machine decides when the link comes up (dial accepted) and when it is
//! torn down (carrier lost, shutdown).

use log::info;
use std::sync::Arc;

use crate::events::EventBus;

/// The external IP stack consuming the point-to-point byte stream.
pub trait NetStack: Send {
    fn link_up(&mut self);
    fn link_down(&mut self);
    /// Bytes arriving from the peer, to be fed into the stack.
    fn input(&mut self, data: &[u8]);
    /// Bytes the stack wants transmitted to the peer, if any.
    fn poll_output(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Stack stub that only counts traffic; used when no IP stack is wired up
/// and by the tests.
#[derive(Default)]
pub struct NullNetStack {
    pub up: bool,
    pub rx_bytes: u64,
}

impl NetStack for NullNetStack {
    fn link_up(&mut self) {
        self.up = true;
    }
    fn link_down(&mut self) {
        self.up = false;
    }
    fn input(&mut self, data: &[u8]) {
        self.rx_bytes += data.len() as u64;
    }
}

pub struct PppChannel {
    channel: u8,
    connected: bool,
    rx_bytes: u64,
    tx_bytes: u64,
    stack: Box<dyn NetStack>,
    events: Arc<EventBus>,
}

impl PppChannel {
    #[must_use]
    pub fn new(channel: u8, stack: Box<dyn NetStack>, events: Arc<EventBus>) -> Self {
        Self {
            channel,
            connected: false,
            rx_bytes: 0,
            tx_bytes: 0,
            stack,
            events,
        }
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    #[must_use]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    /// The dial was accepted; hand the byte stream to the stack.
    pub fn link_up(&mut self) {
        if self.connected {
            return;
        }
        info!("PPP link up on channel {}", self.channel);
        self.connected = true;
        self.stack.link_up();
        self.events.signal("system.modem.netup");
    }

    /// Carrier lost or deliberate teardown.
    pub fn link_down(&mut self) {
        if !self.connected {
            return;
        }
        info!(
            "PPP link down (rx {} tx {} bytes)",
            self.rx_bytes, self.tx_bytes
        );
        self.connected = false;
        self.stack.link_down();
        self.events.signal("system.modem.netdown");
    }

    /// Bytes arriving on the data channel while the link is up.
    pub fn incoming(&mut self, data: &[u8]) {
        self.rx_bytes += data.len() as u64;
        self.stack.input(data);
    }

    /// Bytes the stack wants sent; the caller frames them onto the data
    /// channel.
    pub fn pump_output(&mut self) -> Option<Vec<u8>> {
        let data = self.stack.poll_output()?;
        self.tx_bytes += data.len() as u64;
        Some(data)
    }
}

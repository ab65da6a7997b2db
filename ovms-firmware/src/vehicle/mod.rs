//! Vehicle decoder contract and registry.
//!
//! A decoder consumes completed poll replies and raw CAN frames and turns
//! them into metrics. Decoders never block, declare all their metrics at
//! construction, and tolerate short replies (skip with a debug log).
//! Vehicle models register by code; the boot configuration picks one.

pub mod edrive;

use log::debug;
use std::sync::Arc;

use crate::can::CanFrame;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::poller::{PollEntry, PollReply, PollerCtl};

pub trait VehicleDecoder: Send {
    /// Short model code, e.g. `EDRV`.
    fn vehicle_type(&self) -> &'static str;

    /// The static poll table for this vehicle.
    fn poll_table(&self) -> &[PollEntry];

    /// CAN ids whose traffic indicates the vehicle is energized; used by
    /// the poller's READY heuristic.
    fn ready_indicator_rx(&self) -> &[u32] {
        &[]
    }

    /// Called exactly once per completed poll response.
    fn on_poll_reply(&mut self, reply: &PollReply<'_>, ctl: &mut PollerCtl);

    /// Negative response delivered for one of our requests.
    fn on_poll_error(&mut self, entry: &PollEntry, nrc: u8) {
        debug!(
            "Negative response for type {:02x} pid {:04x}: NRC {nrc:02x}",
            entry.poll_type, entry.pid
        );
    }

    /// Raw CAN tap, called for every received frame.
    fn on_frame_rx(&mut self, frame: &CanFrame) {
        let _ = frame;
    }

    fn on_ticker_1(&mut self, ctl: &mut PollerCtl) {
        let _ = ctl;
    }

    fn on_ticker_10(&mut self, ctl: &mut PollerCtl) {
        let _ = ctl;
    }
}

type VehicleCtor = fn(&Metrics, Arc<EventBus>) -> Box<dyn VehicleDecoder>;

const VEHICLES: &[(&str, &str, VehicleCtor)] = &[(
    "EDRV",
    "Demo battery-electric vehicle",
    |metrics, events| Box::new(edrive::EdriveVehicle::new(metrics, events)),
)];

/// Instantiate a decoder by model code.
#[must_use]
pub fn create(
    code: &str,
    metrics: &Metrics,
    events: Arc<EventBus>,
) -> Option<Box<dyn VehicleDecoder>> {
    VEHICLES
        .iter()
        .find(|(key, _, _)| *key == code)
        .map(|(_, _, ctor)| ctor(metrics, events))
}

/// Registered (code, name) pairs for listings.
#[must_use]
pub fn registered() -> Vec<(&'static str, &'static str)> {
    VEHICLES.iter().map(|(code, name, _)| (*code, *name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let metrics = Metrics::new();
        let events = EventBus::new();
        let vehicle = create("EDRV", &metrics, events.clone()).unwrap();
        assert_eq!(vehicle.vehicle_type(), "EDRV");
        assert!(!vehicle.poll_table().is_empty());

        assert!(create("NOPE", &metrics, events).is_none());
        assert_eq!(registered().len(), 1);
    }
}

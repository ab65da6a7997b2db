//! Demo battery-electric vehicle decoder.
//!
//! All ECUs sit behind a central gateway: requests go to 0x6F1 with the
//! target ECU address in the first byte (extended ISO-TP addressing),
//! responses come back on 0x600 + address. Data items are UDS
//! ReadDataByIdentifier records.
//!
//! The power steering ECU is only polled because it is powered exactly
//! while the vehicle is ready to drive; its responses feed the poller's
//! READY heuristic.

use log::{debug, info};
use std::sync::Arc;

use crate::events::EventBus;
use crate::metrics::{standard, Metric, MetricKind, Metrics, Unit, STALE_MID};
use crate::poller::{
    Addressing, PollEntry, PollReply, PollerCtl, PollerState, POLL_TYPE_READ_DATA,
};
use crate::vehicle::VehicleDecoder;

/// Gateway id all requests are sent to.
const GATEWAY_TX: u32 = 0x6F1;

/// ECU addresses behind the gateway.
const ECU_BMS: u8 = 0x07; // battery management
const ECU_DASH: u8 = 0x60; // instrument panel
const ECU_CHARGER: u8 = 0x61; // charge interface module
const ECU_EPS: u8 = 0x30; // power steering

const fn rx_of(ecu: u8) -> u32 {
    0x600 + ecu as u32
}

// Battery management records
const PID_SOC_DISPLAY: u16 = 0xDDBC;
const PID_HV_VOLTAGE: u16 = 0xDD68;
const PID_HV_CURRENT: u16 = 0xDD69;
const PID_PACK_TEMPS: u16 = 0xDDC0;

// Instrument panel records
const PID_SPEED: u16 = 0xD107;
const PID_ODOMETER: u16 = 0xD10D;
const PID_AMBIENT_TEMP: u16 = 0xD112;
const PID_RANGE_EST: u16 = 0xD111;

// Charge interface records
const PID_PLUG_PROXIMITY: u16 = 0xDEF5;
const PID_CHARGE_LED: u16 = 0xDEF3;

// Power steering, readiness indicator only
const PID_EPS_TORQUE: u16 = 0xDB99;

/// Charge status lamp showing active charging (flashing blue).
const LED_CHARGING_ACTIVE: u8 = 3;
/// Charge status lamp showing a timed charge pending (solid blue).
const LED_CHARGING_TIMED: u8 = 2;

const fn entry(ecu: u8, pid: u16, periods: [u16; 4]) -> PollEntry {
    PollEntry {
        tx_id: GATEWAY_TX,
        rx_id: rx_of(ecu),
        poll_type: POLL_TYPE_READ_DATA,
        pid,
        periods,
        bus: 1,
        addressing: Addressing::Extended { address: ecu },
    }
}

// TXMODULEID, RXMODULEID, TYPE, PID, { POLLTIMES }, BUS, ADDRESSING
const EDRIVE_POLLS: &[PollEntry] = &[
    entry(ECU_BMS, PID_SOC_DISPLAY, [0, 30, 10, 10]),
    entry(ECU_BMS, PID_HV_VOLTAGE, [0, 2, 1, 2]),
    entry(ECU_BMS, PID_HV_CURRENT, [0, 2, 1, 2]),
    entry(ECU_BMS, PID_PACK_TEMPS, [0, 30, 10, 10]),
    entry(ECU_DASH, PID_SPEED, [0, 10, 1, 10]),
    entry(ECU_DASH, PID_ODOMETER, [0, 60, 10, 60]),
    entry(ECU_DASH, PID_AMBIENT_TEMP, [0, 10, 10, 10]),
    entry(ECU_DASH, PID_RANGE_EST, [0, 5, 5, 5]),
    entry(ECU_CHARGER, PID_PLUG_PROXIMITY, [0, 10, 10, 10]),
    entry(ECU_CHARGER, PID_CHARGE_LED, [0, 10, 10, 10]),
    entry(ECU_EPS, PID_EPS_TORQUE, [0, 5, 5, 5]),
];

const READY_INDICATORS: &[u32] = &[rx_of(ECU_EPS)];

pub struct EdriveVehicle {
    m_soc: Arc<Metric>,
    m_voltage: Arc<Metric>,
    m_current: Arc<Metric>,
    m_power: Arc<Metric>,
    m_bat_temp: Arc<Metric>,
    m_speed: Arc<Metric>,
    m_odometer: Arc<Metric>,
    m_env_temp: Arc<Metric>,
    m_range: Arc<Metric>,
    m_pilot: Arc<Metric>,
    m_charging: Arc<Metric>,
    m_env_on: Arc<Metric>,
    m_env_awake: Arc<Metric>,
    /// Raw charge status lamp value; the bit field is only partially
    /// understood, so it is published as-is.
    m_charge_ledstate: Arc<Metric>,
    m_pollermode: Arc<Metric>,

    events: Arc<EventBus>,
}

impl EdriveVehicle {
    pub fn new(metrics: &Metrics, events: Arc<EventBus>) -> Self {
        info!("EDrive demo vehicle module");
        Self {
            m_soc: metrics.init_float(standard::V_BAT_SOC, STALE_MID, Unit::Percentage),
            m_voltage: metrics.init_float(standard::V_BAT_VOLTAGE, STALE_MID, Unit::Volts),
            m_current: metrics.init_float(standard::V_BAT_CURRENT, STALE_MID, Unit::Amps),
            m_power: metrics.init_float(standard::V_BAT_POWER, STALE_MID, Unit::Kilowatts),
            m_bat_temp: metrics.init_float(standard::V_BAT_TEMP, STALE_MID, Unit::Celsius),
            m_speed: metrics.init_float(standard::V_POS_SPEED, STALE_MID, Unit::Kph),
            m_odometer: metrics.init_float(standard::V_POS_ODOMETER, STALE_MID, Unit::Kilometers),
            m_env_temp: metrics.init_float(standard::V_ENV_TEMP, STALE_MID, Unit::Celsius),
            m_range: metrics.init_float(standard::V_BAT_RANGE_EST, STALE_MID, Unit::Kilometers),
            m_pilot: metrics.init_bool(standard::V_CHARGE_PILOT, 0),
            m_charging: metrics.init_bool(standard::V_CHARGE_CHARGING, 0),
            m_env_on: metrics.init_bool(standard::V_ENV_ON, 0),
            m_env_awake: metrics.init_bool(standard::V_ENV_AWAKE, 0),
            m_charge_ledstate: metrics.init(
                "xed.v.charge.ledstate",
                MetricKind::Int,
                STALE_MID,
                Unit::Other,
            ),
            m_pollermode: metrics.init("xed.s.pollermode", MetricKind::Int, STALE_MID, Unit::Other),
            events,
        }
    }

    fn handle_bms(&mut self, pid: u16, data: &[u8]) {
        match pid {
            PID_SOC_DISPLAY => {
                if let Some(raw) = u16_at(data, 0) {
                    self.m_soc.set_float(f32::from(raw) / 10.0);
                }
            }
            PID_HV_VOLTAGE => {
                if let Some(raw) = u16_at(data, 0) {
                    let volts = f32::from(raw) / 100.0;
                    self.m_voltage.set_float(volts);
                    self.update_power();
                }
            }
            PID_HV_CURRENT => {
                if let Some(raw) = u16_at(data, 0) {
                    let amps = f32::from(raw as i16) / 100.0;
                    self.m_current.set_float(amps);
                    self.update_power();
                }
            }
            PID_PACK_TEMPS => {
                // min, max, avg; publish the average
                if data.len() >= 3 {
                    self.m_bat_temp.set_float(f32::from(data[2] as i8));
                }
            }
            _ => debug!("Unhandled battery record {pid:04x}"),
        }
    }

    fn handle_dash(&mut self, pid: u16, data: &[u8]) {
        match pid {
            PID_SPEED => {
                if let Some(raw) = u16_at(data, 0) {
                    self.m_speed.set_float(f32::from(raw) / 10.0);
                }
            }
            PID_ODOMETER => {
                if data.len() >= 3 {
                    let km = (u32::from(data[0]) << 16) | (u32::from(data[1]) << 8) | u32::from(data[2]);
                    self.m_odometer.set_float(km as f32);
                }
            }
            PID_AMBIENT_TEMP => {
                if let Some(&raw) = data.first() {
                    self.m_env_temp.set_float(f32::from(raw) / 2.0 - 40.0);
                }
            }
            PID_RANGE_EST => {
                if let Some(raw) = u16_at(data, 0) {
                    self.m_range.set_float(f32::from(raw));
                }
            }
            _ => debug!("Unhandled dash record {pid:04x}"),
        }
    }

    fn handle_charger(&mut self, pid: u16, data: &[u8], ctl: &mut PollerCtl) {
        match pid {
            PID_PLUG_PROXIMITY => {
                if let Some(&raw) = data.first() {
                    let plugged = raw != 0;
                    if self.m_pilot.set_bool(plugged) {
                        self.events.signal(if plugged {
                            "vehicle.charge.pilot.on"
                        } else {
                            "vehicle.charge.pilot.off"
                        });
                    }
                }
            }
            PID_CHARGE_LED => {
                let Some(&led) = data.first() else {
                    debug!("Short charge LED record");
                    return;
                };
                self.m_charge_ledstate.set_int(i64::from(led));
                let charging = led == LED_CHARGING_ACTIVE || led == LED_CHARGING_TIMED;
                if self.m_charging.set_bool(charging) {
                    self.events.signal(if charging {
                        "vehicle.charge.start"
                    } else {
                        "vehicle.charge.stop"
                    });
                }
                if charging && ctl.state() != PollerState::Charging {
                    ctl.set_state(PollerState::Charging);
                } else if !charging && ctl.state() == PollerState::Charging {
                    ctl.set_state(PollerState::Alive);
                }
            }
            _ => debug!("Unhandled charger record {pid:04x}"),
        }
    }

    fn update_power(&self) {
        let kw = self.m_voltage.as_float() * self.m_current.as_float() / 1000.0;
        self.m_power.set_float(kw);
    }
}

impl VehicleDecoder for EdriveVehicle {
    fn vehicle_type(&self) -> &'static str {
        "EDRV"
    }

    fn poll_table(&self) -> &[PollEntry] {
        EDRIVE_POLLS
    }

    fn ready_indicator_rx(&self) -> &[u32] {
        READY_INDICATORS
    }

    fn on_poll_reply(&mut self, reply: &PollReply<'_>, ctl: &mut PollerCtl) {
        match reply.rx_id {
            id if id == rx_of(ECU_BMS) => self.handle_bms(reply.pid, reply.data),
            id if id == rx_of(ECU_DASH) => self.handle_dash(reply.pid, reply.data),
            id if id == rx_of(ECU_CHARGER) => self.handle_charger(reply.pid, reply.data, ctl),
            id if id == rx_of(ECU_EPS) => {
                // readiness indicator only, nothing to decode
            }
            id => debug!("Poll reply from unexpected module {id:03x}"),
        }
    }

    fn on_ticker_1(&mut self, ctl: &mut PollerCtl) {
        let state = ctl.state();
        self.m_pollermode.set_int(state as i64);
        self.m_env_awake.set_bool(state != PollerState::Shutdown);
        self.m_env_on.set_bool(state == PollerState::Ready);
    }
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle() -> (EdriveVehicle, Arc<Metrics>) {
        let metrics = Metrics::new();
        let events = EventBus::new();
        (EdriveVehicle::new(&metrics, events), metrics)
    }

    fn reply(ecu: u8, pid: u16, data: &[u8]) -> PollReply<'_> {
        PollReply {
            bus: 1,
            tx_id: GATEWAY_TX,
            rx_id: rx_of(ecu),
            poll_type: POLL_TYPE_READ_DATA,
            pid,
            data,
            remaining: 0,
        }
    }

    #[test]
    fn soc_and_voltage_decode() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Alive);

        vehicle.on_poll_reply(&reply(ECU_BMS, PID_SOC_DISPLAY, &[0x03, 0x20]), &mut ctl);
        assert_eq!(metrics.find(standard::V_BAT_SOC).unwrap().as_float(), 80.0);

        vehicle.on_poll_reply(&reply(ECU_BMS, PID_HV_VOLTAGE, &[0x8C, 0xA0]), &mut ctl);
        assert_eq!(
            metrics.find(standard::V_BAT_VOLTAGE).unwrap().as_float(),
            360.0
        );
    }

    #[test]
    fn current_is_signed_and_drives_power() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Ready);

        vehicle.on_poll_reply(&reply(ECU_BMS, PID_HV_VOLTAGE, &[0x8C, 0xA0]), &mut ctl);
        // -100.00 A as two's complement
        let raw = (-10000i16) as u16;
        vehicle.on_poll_reply(
            &reply(ECU_BMS, PID_HV_CURRENT, &raw.to_be_bytes()),
            &mut ctl,
        );
        assert_eq!(
            metrics.find(standard::V_BAT_CURRENT).unwrap().as_float(),
            -100.0
        );
        assert_eq!(metrics.find(standard::V_BAT_POWER).unwrap().as_float(), -36.0);
    }

    #[test]
    fn short_replies_are_skipped() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Alive);
        vehicle.on_poll_reply(&reply(ECU_BMS, PID_SOC_DISPLAY, &[0x03]), &mut ctl);
        assert!(!metrics.find(standard::V_BAT_SOC).unwrap().is_defined());
    }

    #[test]
    fn charge_led_kept_raw_and_requests_charging() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Alive);

        vehicle.on_poll_reply(&reply(ECU_CHARGER, PID_CHARGE_LED, &[3]), &mut ctl);
        assert_eq!(
            metrics.find("xed.v.charge.ledstate").unwrap().as_int(),
            3
        );
        assert!(metrics
            .find(standard::V_CHARGE_CHARGING)
            .unwrap()
            .as_bool());
        assert_eq!(ctl.take_request(), Some(PollerState::Charging));

        let mut ctl = PollerCtl::new(PollerState::Charging);
        vehicle.on_poll_reply(&reply(ECU_CHARGER, PID_CHARGE_LED, &[6]), &mut ctl);
        assert_eq!(metrics.find("xed.v.charge.ledstate").unwrap().as_int(), 6);
        assert!(!metrics
            .find(standard::V_CHARGE_CHARGING)
            .unwrap()
            .as_bool());
        assert_eq!(ctl.take_request(), Some(PollerState::Alive));
    }

    #[test]
    fn ambient_temp_offset() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Alive);
        vehicle.on_poll_reply(&reply(ECU_DASH, PID_AMBIENT_TEMP, &[120]), &mut ctl);
        assert_eq!(metrics.find(standard::V_ENV_TEMP).unwrap().as_float(), 20.0);
    }

    #[test]
    fn ticker_publishes_poller_mode() {
        let (mut vehicle, metrics) = vehicle();
        let mut ctl = PollerCtl::new(PollerState::Ready);
        vehicle.on_ticker_1(&mut ctl);
        assert_eq!(metrics.find("xed.s.pollermode").unwrap().as_int(), 2);
        assert!(metrics.find(standard::V_ENV_ON).unwrap().as_bool());
        assert!(metrics.find(standard::V_ENV_AWAKE).unwrap().as_bool());
    }
}

//! NMEA 0183 parsing for the modem's GPS channel.
//!
//! The GPS shares the modem and arrives on its own mux channel as plain
//! `$`-prefixed sentences. Only the two subscribed sentence types are
//! handled: `$..RMC` for UTC time/date, speed and course, `$..GNS` for
//! position and fix data. Anything with a bad checksum is dropped and
//! counted.

use log::{debug, info};
use std::sync::Arc;

use crate::events::EventBus;
use crate::metrics::{standard, Metric, Metrics};

/// Knots to km/h.
const KNOTS_TO_KPH: f32 = 1.852;

pub struct NmeaParser {
    gps_lock: bool,
    checksum_errors: u32,

    m_latitude: Arc<Metric>,
    m_longitude: Arc<Metric>,
    m_altitude: Arc<Metric>,
    m_direction: Arc<Metric>,
    m_gpsspeed: Arc<Metric>,
    m_gpslock: Arc<Metric>,
    m_satcount: Arc<Metric>,
    m_gpshdop: Arc<Metric>,
    m_gpstime: Arc<Metric>,

    events: Arc<EventBus>,
}

impl NmeaParser {
    #[must_use]
    pub fn new(metrics: &Metrics, events: Arc<EventBus>) -> Self {
        Self {
            gps_lock: false,
            checksum_errors: 0,
            m_latitude: metrics.init_float(standard::V_POS_LATITUDE, 0, crate::metrics::Unit::Degrees),
            m_longitude: metrics.init_float(standard::V_POS_LONGITUDE, 0, crate::metrics::Unit::Degrees),
            m_altitude: metrics.init_float(standard::V_POS_ALTITUDE, 0, crate::metrics::Unit::Meters),
            m_direction: metrics.init_float(standard::V_POS_DIRECTION, 0, crate::metrics::Unit::Degrees),
            m_gpsspeed: metrics.init_float(standard::V_POS_GPSSPEED, 0, crate::metrics::Unit::Kph),
            m_gpslock: metrics.init_bool(standard::V_POS_GPSLOCK, 0),
            m_satcount: metrics.init_int(standard::V_POS_SATCOUNT, 0, crate::metrics::Unit::Other),
            m_gpshdop: metrics.init_float(standard::V_POS_GPSHDOP, 0, crate::metrics::Unit::Other),
            m_gpstime: metrics.init_string(standard::V_POS_GPSTIME, 0),
            events,
        }
    }

    #[must_use]
    pub fn checksum_errors(&self) -> u32 {
        self.checksum_errors
    }

    #[must_use]
    pub fn has_lock(&self) -> bool {
        self.gps_lock
    }

    /// Feed one line from the NMEA channel.
    pub fn incoming_line(&mut self, line: &str) {
        let Some(body) = validate_sentence(line) else {
            if line.starts_with('$') {
                self.checksum_errors += 1;
                debug!("NMEA checksum failure: {line:?}");
            }
            return;
        };

        let fields: Vec<&str> = body.split(',').collect();
        let Some(talker) = fields.first() else {
            return;
        };
        if talker.len() < 5 {
            return;
        }
        match &talker[2..5] {
            "RMC" => self.handle_rmc(&fields),
            "GNS" => self.handle_gns(&fields),
            _ => {}
        }
    }

    /// `$..RMC,<time>,<status>,<lat>,<NS>,<lon>,<EW>,<knots>,<course>,<date>,...`
    fn handle_rmc(&mut self, fields: &[&str]) {
        if fields.len() < 10 {
            return;
        }
        let valid = fields[2] == "A";
        if !valid {
            return;
        }
        if let Ok(course) = fields[8].parse::<f32>() {
            self.m_direction.set_float(course);
        }
        if let Ok(knots) = fields[7].parse::<f32>() {
            self.m_gpsspeed.set_float(knots * KNOTS_TO_KPH);
        }
        if let Some(utc) = format_utc(fields[9], fields[1]) {
            self.m_gpstime.set_string(&utc);
        }
    }

    /// `$..GNS,<time>,<lat>,<NS>,<lon>,<EW>,<posmode>,<numsv>,<hdop>,<alt>,...`
    fn handle_gns(&mut self, fields: &[&str]) {
        if fields.len() < 10 {
            return;
        }
        // one mode character per constellation; any fixed one counts
        let lock = fields[6]
            .chars()
            .any(|c| matches!(c, 'A' | 'D' | 'E' | 'F' | 'R'));

        if lock {
            if let Some(lat) = parse_coordinate(fields[1], fields[2]) {
                self.m_latitude.set_float(lat);
            }
            if let Some(lon) = parse_coordinate(fields[3], fields[4]) {
                self.m_longitude.set_float(lon);
            }
            if let Ok(satcount) = fields[7].parse::<i64>() {
                self.m_satcount.set_int(satcount);
            }
            if let Ok(hdop) = fields[8].parse::<f32>() {
                self.m_gpshdop.set_float(hdop);
            }
            if let Ok(alt) = fields[9].parse::<f32>() {
                self.m_altitude.set_float(alt);
            }
        }

        if lock != self.gps_lock {
            self.gps_lock = lock;
            self.m_gpslock.set_bool(lock);
            if lock {
                info!("GPS lock acquired");
                self.events.signal("system.vehicle.gps.lock.acquired");
            } else {
                info!("GPS lock lost");
                self.events.signal("system.vehicle.gps.lock.lost");
            }
        }
    }
}

/// Validate `$...*hh` framing and checksum; returns the body between `$`
/// and `*`.
#[must_use]
pub fn validate_sentence(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('$')?;
    let star = rest.rfind('*')?;
    let (body, checksum) = rest.split_at(star);
    let expected = u8::from_str_radix(checksum[1..].trim(), 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual == expected {
        Some(body)
    } else {
        None
    }
}

/// Convert `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed degrees.
#[must_use]
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f32> {
    let raw: f64 = value.parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let mut result = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        result = -result;
    }
    Some(result as f32)
}

/// Combine `ddmmyy` and `hhmmss.sss` into `20yy-mm-dd hh:mm:ss UTC`.
#[must_use]
fn format_utc(date: &str, time: &str) -> Option<String> {
    if date.len() < 6 || time.len() < 6 {
        return None;
    }
    Some(format!(
        "20{}-{}-{} {}:{}:{} UTC",
        &date[4..6],
        &date[2..4],
        &date[0..2],
        &time[0..2],
        &time[2..4],
        &time[4..6]
    ))
}

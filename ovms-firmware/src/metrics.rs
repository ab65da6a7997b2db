//! Process-wide registry of typed, unit-tagged telemetry values.
//!
//! Every producer (vehicle decoders, the modem, the Wi-Fi controller)
//! publishes through here; exporters and the shell read from here. Scalar
//! metrics store their value in a single atomic so the hot path takes no
//! lock; strings and vectors take a per-metric mutex.
//!
//! Setting a metric always refreshes its last-modified timestamp; the
//! modification counter only advances when the value actually changed.

use indexmap::IndexMap;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::monotonic_secs;

/// Staleness presets, in seconds.
pub const STALE_MIN: u32 = 10;
pub const STALE_MID: u32 = 120;
pub const STALE_HIGH: u32 = 3600;

/// Measurement unit attached to a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    #[default]
    Other,
    Percentage,
    Volts,
    Amps,
    Kilowatts,
    KilowattHours,
    Kilometers,
    Kph,
    Celsius,
    Dbm,
    Seconds,
    Minutes,
    Degrees,
    Meters,
    Kpa,
}

impl Unit {
    /// Short label for listings; empty for dimensionless metrics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Unit::Other => "",
            Unit::Percentage => "%",
            Unit::Volts => "V",
            Unit::Amps => "A",
            Unit::Kilowatts => "kW",
            Unit::KilowattHours => "kWh",
            Unit::Kilometers => "km",
            Unit::Kph => "km/h",
            Unit::Celsius => "\u{b0}C",
            Unit::Dbm => "dBm",
            Unit::Seconds => "s",
            Unit::Minutes => "min",
            Unit::Degrees => "\u{b0}",
            Unit::Meters => "m",
            Unit::Kpa => "kPa",
        }
    }
}

/// Value shape of a metric, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Bool,
    Int,
    Float,
    String,
    Vector,
}

/// One registered metric.
pub struct Metric {
    name: String,
    kind: MetricKind,
    unit: Unit,
    autostale: u32,
    scalar: AtomicU64,
    text: Mutex<String>,
    vector: Mutex<Vec<f32>>,
    defined: AtomicBool,
    last_modified: AtomicU64,
    modified: AtomicU32,
}

impl Metric {
    fn new(name: &str, kind: MetricKind, autostale: u32, unit: Unit) -> Self {
        Self {
            name: name.to_string(),
            kind,
            unit,
            autostale,
            scalar: AtomicU64::new(0),
            text: Mutex::new(String::new()),
            vector: Mutex::new(Vec::new()),
            defined: AtomicBool::new(false),
            last_modified: AtomicU64::new(0),
            modified: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    #[must_use]
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// True once a value has ever been set.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.defined.load(Ordering::Relaxed)
    }

    /// True when an autostale timeout is configured and exceeded.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        if self.autostale == 0 || !self.is_defined() {
            return false;
        }
        monotonic_secs().saturating_sub(self.last_modified.load(Ordering::Relaxed))
            > u64::from(self.autostale)
    }

    #[must_use]
    pub fn last_modified_secs(&self) -> u64 {
        self.last_modified.load(Ordering::Relaxed)
    }

    /// Number of value changes since registration.
    #[must_use]
    pub fn modified_count(&self) -> u32 {
        self.modified.load(Ordering::Relaxed)
    }

    fn touch(&self, changed: bool) -> bool {
        self.last_modified.store(monotonic_secs(), Ordering::Relaxed);
        let first = !self.defined.swap(true, Ordering::Relaxed);
        if changed || first {
            self.modified.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Set a float value; returns whether the value changed.
    pub fn set_float(&self, value: f32) -> bool {
        let old = self.scalar.swap(u64::from(value.to_bits()), Ordering::Relaxed);
        self.touch(old != u64::from(value.to_bits()))
    }

    #[must_use]
    pub fn as_float(&self) -> f32 {
        f32::from_bits(self.scalar.load(Ordering::Relaxed) as u32)
    }

    pub fn set_int(&self, value: i64) -> bool {
        let new = value as u64;
        let old = self.scalar.swap(new, Ordering::Relaxed);
        self.touch(old != new)
    }

    #[must_use]
    pub fn as_int(&self) -> i64 {
        self.scalar.load(Ordering::Relaxed) as i64
    }

    pub fn set_bool(&self, value: bool) -> bool {
        let new = u64::from(value);
        let old = self.scalar.swap(new, Ordering::Relaxed);
        self.touch(old != new)
    }

    #[must_use]
    pub fn as_bool(&self) -> bool {
        self.scalar.load(Ordering::Relaxed) != 0
    }

    pub fn set_string(&self, value: &str) -> bool {
        let mut text = self.text.lock().unwrap();
        let changed = *text != value;
        if changed {
            value.clone_into(&mut text);
        }
        drop(text);
        self.touch(changed)
    }

    #[must_use]
    pub fn as_string(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn set_vector(&self, value: &[f32]) -> bool {
        let mut vector = self.vector.lock().unwrap();
        let changed = vector.as_slice() != value;
        if changed {
            vector.clear();
            vector.extend_from_slice(value);
        }
        drop(vector);
        self.touch(changed)
    }

    #[must_use]
    pub fn as_vector(&self) -> Vec<f32> {
        self.vector.lock().unwrap().clone()
    }

    /// Render the current value for listings.
    #[must_use]
    pub fn format_value(&self) -> String {
        if !self.is_defined() {
            return String::new();
        }
        match self.kind {
            MetricKind::Bool => {
                if self.as_bool() { "yes" } else { "no" }.to_string()
            }
            MetricKind::Int => self.as_int().to_string(),
            MetricKind::Float => format!("{:.4}", self.as_float()),
            MetricKind::String => self.as_string(),
            MetricKind::Vector => self
                .as_vector()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// The registry. Registration order is preserved for listings.
#[derive(Default)]
pub struct Metrics {
    registry: Mutex<IndexMap<String, Arc<Metric>>>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Find an existing metric or register a new one. An existing metric
    /// keeps its original kind/unit; decoders share handles this way.
    pub fn init(&self, name: &str, kind: MetricKind, autostale: u32, unit: Unit) -> Arc<Metric> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(metric) = registry.get(name) {
            return metric.clone();
        }
        debug!("Registering metric {name}");
        let metric = Arc::new(Metric::new(name, kind, autostale, unit));
        registry.insert(name.to_string(), metric.clone());
        metric
    }

    pub fn init_float(&self, name: &str, autostale: u32, unit: Unit) -> Arc<Metric> {
        self.init(name, MetricKind::Float, autostale, unit)
    }

    pub fn init_int(&self, name: &str, autostale: u32, unit: Unit) -> Arc<Metric> {
        self.init(name, MetricKind::Int, autostale, unit)
    }

    pub fn init_bool(&self, name: &str, autostale: u32) -> Arc<Metric> {
        self.init(name, MetricKind::Bool, autostale, Unit::Other)
    }

    pub fn init_string(&self, name: &str, autostale: u32) -> Arc<Metric> {
        self.init(name, MetricKind::String, autostale, Unit::Other)
    }

    pub fn init_vector(&self, name: &str, autostale: u32, unit: Unit) -> Arc<Metric> {
        self.init(name, MetricKind::Vector, autostale, unit)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Metric>> {
        self.registry.lock().unwrap().get(name).cloned()
    }

    /// Formatted listing of all metrics whose name starts with `prefix`.
    #[must_use]
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let registry = self.registry.lock().unwrap();
        registry
            .values()
            .filter(|m| m.name().starts_with(prefix))
            .map(|m| {
                let stale = if m.is_stale() { " [stale]" } else { "" };
                format!(
                    "{:<30} {}{}{}",
                    m.name(),
                    m.format_value(),
                    if m.unit().label().is_empty() { "" } else { m.unit().label() },
                    stale
                )
            })
            .collect()
    }
}

/// Standard metric names shared between producers and consumers.
pub mod standard {
    pub const V_BAT_SOC: &str = "v.b.soc";
    pub const V_BAT_VOLTAGE: &str = "v.b.voltage";
    pub const V_BAT_CURRENT: &str = "v.b.current";
    pub const V_BAT_POWER: &str = "v.b.power";
    pub const V_BAT_TEMP: &str = "v.b.temp";
    pub const V_BAT_RANGE_EST: &str = "v.b.range.est";
    pub const V_POS_SPEED: &str = "v.p.speed";
    pub const V_POS_ODOMETER: &str = "v.p.odometer";
    pub const V_POS_LATITUDE: &str = "v.p.latitude";
    pub const V_POS_LONGITUDE: &str = "v.p.longitude";
    pub const V_POS_ALTITUDE: &str = "v.p.altitude";
    pub const V_POS_DIRECTION: &str = "v.p.direction";
    pub const V_POS_GPSLOCK: &str = "v.p.gpslock";
    pub const V_POS_GPSSPEED: &str = "v.p.gpsspeed";
    pub const V_POS_SATCOUNT: &str = "v.p.satcount";
    pub const V_POS_GPSHDOP: &str = "v.p.gpshdop";
    pub const V_POS_GPSTIME: &str = "v.p.gpstime";
    pub const V_ENV_ON: &str = "v.e.on";
    pub const V_ENV_AWAKE: &str = "v.e.awake";
    pub const V_ENV_TEMP: &str = "v.e.temp";
    pub const V_CHARGE_CHARGING: &str = "v.c.charging";
    pub const V_CHARGE_PILOT: &str = "v.c.pilot";
    pub const NET_PROVIDER: &str = "m.net.provider";
    pub const NET_SQ: &str = "m.net.sq";
    pub const NET_MDM_NETWORK: &str = "m.net.mdm.network";
    pub const NET_MDM_SQ: &str = "m.net.mdm.sq";
    pub const NET_MDM_MODEL: &str = "m.net.mdm.model";
    pub const NET_MDM_NETREG: &str = "m.net.mdm.netreg";
    pub const NET_MDM_GPSTIME: &str = "m.net.mdm.gpstime";
    pub const NET_WIFI_NETWORK: &str = "m.net.wifi.network";
    pub const NET_WIFI_SQ: &str = "m.net.wifi.sq";
}

/// Register the standard metric set consumed by the core subsystems.
pub fn register_standard(metrics: &Metrics) {
    use standard::*;
    use MetricKind::{Bool, Float, Int, String as Str};

    let table: &[(&str, MetricKind, u32, Unit)] = &[
        (V_BAT_SOC, Float, STALE_HIGH, Unit::Percentage),
        (V_BAT_VOLTAGE, Float, STALE_MID, Unit::Volts),
        (V_BAT_CURRENT, Float, STALE_MID, Unit::Amps),
        (V_BAT_POWER, Float, STALE_MID, Unit::Kilowatts),
        (V_BAT_TEMP, Float, STALE_MID, Unit::Celsius),
        (V_BAT_RANGE_EST, Float, STALE_HIGH, Unit::Kilometers),
        (V_POS_SPEED, Float, STALE_MIN, Unit::Kph),
        (V_POS_ODOMETER, Float, STALE_HIGH, Unit::Kilometers),
        (V_POS_LATITUDE, Float, STALE_MIN, Unit::Degrees),
        (V_POS_LONGITUDE, Float, STALE_MIN, Unit::Degrees),
        (V_POS_ALTITUDE, Float, STALE_MIN, Unit::Meters),
        (V_POS_DIRECTION, Float, STALE_MIN, Unit::Degrees),
        (V_POS_GPSLOCK, Bool, 0, Unit::Other),
        (V_POS_GPSSPEED, Float, STALE_MIN, Unit::Kph),
        (V_POS_SATCOUNT, Int, STALE_MIN, Unit::Other),
        (V_POS_GPSHDOP, Float, STALE_MIN, Unit::Other),
        (V_POS_GPSTIME, Str, 0, Unit::Other),
        (V_ENV_ON, Bool, 0, Unit::Other),
        (V_ENV_AWAKE, Bool, 0, Unit::Other),
        (V_ENV_TEMP, Float, STALE_MID, Unit::Celsius),
        (V_CHARGE_CHARGING, Bool, 0, Unit::Other),
        (V_CHARGE_PILOT, Bool, 0, Unit::Other),
        (NET_PROVIDER, Str, 0, Unit::Other),
        (NET_SQ, Float, STALE_MID, Unit::Dbm),
        (NET_MDM_NETWORK, Str, 0, Unit::Other),
        (NET_MDM_SQ, Float, STALE_MID, Unit::Dbm),
        (NET_MDM_MODEL, Str, 0, Unit::Other),
        (NET_MDM_NETREG, Str, 0, Unit::Other),
        (NET_MDM_GPSTIME, Str, 0, Unit::Other),
        (NET_WIFI_NETWORK, Str, 0, Unit::Other),
        (NET_WIFI_SQ, Float, STALE_MID, Unit::Dbm),
    ];
    for &(name, kind, autostale, unit) in table {
        metrics.init(name, kind, autostale, unit);
    }
}

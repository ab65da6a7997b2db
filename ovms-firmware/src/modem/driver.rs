//! Cellular modem driver models.
//!
//! The base driver provides defaults and just enough behavior to identify
//! the modem model from its `ATI` banner; once identified, the modem task
//! rebinds to the specific driver. Drivers contribute the per-model
//! details: mux channel assignment, power pulse timing, GPS start/stop
//! commands and the status poller command string.

pub trait ModemDriver: Send {
    fn model(&self) -> &'static str;
    fn name(&self) -> &'static str;

    /// Number of data channels multiplexed on top of the control channel.
    fn mux_channels(&self) -> u8 {
        4
    }
    fn channel_ctrl(&self) -> u8 {
        0
    }
    fn channel_nmea(&self) -> u8 {
        1
    }
    fn channel_data(&self) -> u8 {
        2
    }
    fn channel_poll(&self) -> u8 {
        3
    }
    fn channel_cmd(&self) -> u8 {
        4
    }

    /// How long the power key must be held when switching on, in seconds.
    fn power_pulse_secs(&self) -> u32 {
        2
    }

    /// Switch on GPS and subscribe to NMEA sentences:
    ///   2 = $..RMC -- UTC time & date
    ///  64 = $..GNS -- Position & fix data
    fn gps_startup(&self) -> &'static str {
        "AT+CGPSNMEA=66;+CGPS=1,1\r\n"
    }

    fn gps_shutdown(&self) -> &'static str {
        "AT+CGPS=0\r\n"
    }

    fn status_poller(&self) -> &'static str {
        "AT+CREG?;+CCLK?;+CSQ;+COPS?\r\n"
    }

    fn power_off_command(&self) -> &'static str {
        "AT+CPOF\r\n"
    }
}

/// Placeholder driver used until the modem has been identified.
pub struct AutoDriver;

impl ModemDriver for AutoDriver {
    fn model(&self) -> &'static str {
        "auto"
    }
    fn name(&self) -> &'static str {
        "Auto-detect modem (used for identification purposes only)"
    }
}

pub struct Sim5360;

impl ModemDriver for Sim5360 {
    fn model(&self) -> &'static str {
        "SIM5360"
    }
    fn name(&self) -> &'static str {
        "SIMCOM SIM5360"
    }
}

pub struct Sim7600;

impl ModemDriver for Sim7600 {
    fn model(&self) -> &'static str {
        "SIM7600"
    }
    fn name(&self) -> &'static str {
        "SIMCOM SIM7600"
    }
}

type DriverCtor = fn() -> Box<dyn ModemDriver>;

/// Known models, matched as substrings of the `ATI` banner.
const DRIVERS: &[(&str, DriverCtor)] = &[
    ("SIM5360", || Box::new(Sim5360)),
    ("SIM7600", || Box::new(Sim7600)),
];

/// Match an identification line against the known models.
#[must_use]
pub fn detect(line: &str) -> Option<&'static str> {
    DRIVERS
        .iter()
        .find(|(model, _)| line.contains(model))
        .map(|(model, _)| *model)
}

/// Instantiate a driver by model key; unknown models get the auto driver.
#[must_use]
pub fn create(model: &str) -> Box<dyn ModemDriver> {
    DRIVERS
        .iter()
        .find(|(key, _)| *key == model)
        .map_or_else(|| Box::new(AutoDriver) as Box<dyn ModemDriver>, |(_, ctor)| ctor())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_model_from_banner() {
        assert_eq!(detect("Model: SIMCOM_SIM7600G-H"), Some("SIM7600"));
        assert_eq!(detect("SIM5360E"), Some("SIM5360"));
        assert_eq!(detect("Revision: LE20B04SIM7600M22"), Some("SIM7600"));
        assert_eq!(detect("OK"), None);
    }

    #[test]
    fn create_falls_back_to_auto() {
        assert_eq!(create("SIM7600").model(), "SIM7600");
        assert_eq!(create("nonsense").model(), "auto");
    }

    #[test]
    fn default_channel_plan() {
        let driver = Sim7600;
        assert_eq!(driver.mux_channels(), 4);
        assert_eq!(driver.channel_ctrl(), 0);
        assert_eq!(driver.channel_data(), 2);
        assert_eq!(driver.channel_cmd(), 4);
    }
}

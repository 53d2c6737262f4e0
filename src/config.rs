//! Deployment configuration. Fixed for the lifetime of a run; nothing here is
//! persisted by the controller.

use crate::breaker::{
    current_window_valid, Breaker, BreakerHierarchy, DrivePolarity, HysteresisBand, MAX_BREAKERS,
};
use crate::protocol::WireFormat;
use crate::safety::TripPolicy;
use crate::sensor::{Calibration, SensorBank, SensorChannel};
use crate::telemetry::{LoadFieldFill, DEFAULT_TELEMETRY_INTERVAL_MS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Pin map of the three-breaker control panel
pub const PIN_LOAD_CURRENT: u8 = 0;
pub const PIN_SYSTEM_CURRENT: u8 = 1;
pub const PIN_DRIVE_LOAD1: u8 = 2;
pub const PIN_DRIVE_OVERALL: u8 = 3;
pub const PIN_DRIVE_LOAD2: u8 = 4;

pub const DEFAULT_MAX_CURRENT_A: f32 = 5.0;
pub const DEFAULT_MIN_CURRENT_A: f32 = 0.1;

// Voltage-monitor board
pub const PIN_LOAD_VOLTAGE: u8 = 0;
pub const PIN_SUPPLY_VOLTAGE: u8 = 1;
pub const PIN_DRIVE_MOSFET: u8 = 2;
pub const DEFAULT_HIGH_VOLTAGE_V: f32 = 5.0;
pub const DEFAULT_LOW_VOLTAGE_V: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one breaker is required")]
    NoBreakers,
    #[error("{0} breakers configured, exceeds the supported maximum")]
    TooManyBreakers(usize),
    #[error("breaker {0}: current window must satisfy max > min >= 0")]
    InvalidCurrentWindow(usize),
    #[error("breaker {0} starts on while the overall breaker starts off")]
    ChildOnWithoutRoot(usize),
    #[error("hysteresis band must satisfy high > low")]
    InvalidHysteresis,
    #[error("hysteresis policy monitors breaker {0}, which does not exist")]
    MonitoredBreakerMissing(usize),
    #[error("telemetry interval must be non-zero")]
    ZeroInterval,
    #[error("sensor on pin {0} has an unusable calibration")]
    InvalidCalibration(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub name: String,
    pub drive_pin: u8,
    #[serde(default)]
    pub initial_on: bool,
    #[serde(default)]
    pub max_current: Option<f32>,
    #[serde(default)]
    pub min_current: Option<f32>,
    #[serde(default)]
    pub load_sensor: Option<SensorChannel>,
}

impl BreakerConfig {
    pub fn new(name: &str, drive_pin: u8) -> Self {
        Self {
            name: name.to_string(),
            drive_pin,
            initial_on: false,
            max_current: None,
            min_current: None,
            load_sensor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    /// `None` picks the fill the chosen wire format has always used.
    #[serde(default)]
    pub load_fill: Option<LoadFieldFill>,
    #[serde(default)]
    pub announce_trips: bool,
    /// Follow each text frame with a `#` voltage line.
    #[serde(default)]
    pub report_voltage: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            load_fill: None,
            announce_trips: false,
            report_voltage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub breakers: Vec<BreakerConfig>,
    pub polarity: DrivePolarity,
    #[serde(default)]
    pub system_current_sensor: Option<SensorChannel>,
    #[serde(default)]
    pub supply_voltage_sensor: Option<SensorChannel>,
    pub trip_policy: TripPolicy,
    #[serde(default)]
    pub hysteresis: Option<HysteresisBand>,
    pub wire_format: WireFormat,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for PanelConfig {
    /// Three-breaker current-window panel on the text link.
    fn default() -> Self {
        let sensor = Calibration::acs712();
        let load = |name: &str, pin: u8| BreakerConfig {
            max_current: Some(DEFAULT_MAX_CURRENT_A),
            min_current: Some(DEFAULT_MIN_CURRENT_A),
            ..BreakerConfig::new(name, pin)
        };

        Self {
            breakers: vec![
                BreakerConfig::new("Overall", PIN_DRIVE_OVERALL),
                BreakerConfig {
                    load_sensor: Some(SensorChannel::new(PIN_LOAD_CURRENT, sensor)),
                    ..load("Load 1", PIN_DRIVE_LOAD1)
                },
                load("Load 2", PIN_DRIVE_LOAD2),
            ],
            polarity: DrivePolarity::ActiveLow,
            system_current_sensor: Some(SensorChannel::new(PIN_SYSTEM_CURRENT, sensor)),
            supply_voltage_sensor: None,
            trip_policy: TripPolicy::CurrentWindow { windowed: true },
            hysteresis: None,
            wire_format: WireFormat::Text,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl PanelConfig {
    /// The same panel speaking the fixed-width binary link.
    pub fn binary_panel() -> Self {
        Self {
            wire_format: WireFormat::Binary,
            ..Self::default()
        }
    }

    /// Single MOSFET breaker protected by a voltage hysteresis band.
    pub fn voltage_monitor() -> Self {
        Self {
            breakers: vec![BreakerConfig {
                initial_on: true,
                ..BreakerConfig::new("Load", PIN_DRIVE_MOSFET)
            }],
            polarity: DrivePolarity::ActiveLow,
            system_current_sensor: None,
            supply_voltage_sensor: Some(SensorChannel::new(PIN_SUPPLY_VOLTAGE, Calibration::voltage_divider())),
            trip_policy: TripPolicy::Hysteresis {
                breaker: 0,
                sensor: SensorChannel::new(PIN_LOAD_VOLTAGE, Calibration::voltage_divider()),
            },
            hysteresis: HysteresisBand::new(DEFAULT_HIGH_VOLTAGE_V, DEFAULT_LOW_VOLTAGE_V),
            wire_format: WireFormat::Text,
            telemetry: TelemetryConfig {
                announce_trips: true,
                report_voltage: true,
                ..TelemetryConfig::default()
            },
        }
    }

    pub fn load_fill(&self) -> LoadFieldFill {
        self.telemetry
            .load_fill
            .unwrap_or_else(|| LoadFieldFill::default_for(self.wire_format))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breakers.is_empty() {
            return Err(ConfigError::NoBreakers);
        }
        if self.breakers.len() > MAX_BREAKERS {
            return Err(ConfigError::TooManyBreakers(self.breakers.len()));
        }
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        let root_on = self.breakers[0].initial_on;
        for (index, breaker) in self.breakers.iter().enumerate() {
            if index > 0 && breaker.initial_on && !root_on {
                return Err(ConfigError::ChildOnWithoutRoot(index));
            }
            if !current_window_valid(breaker.max_current, breaker.min_current) {
                return Err(ConfigError::InvalidCurrentWindow(index));
            }
            if let Some(sensor) = &breaker.load_sensor {
                check_calibration(sensor)?;
            }
        }
        if let Some(sensor) = &self.system_current_sensor {
            check_calibration(sensor)?;
        }
        if let Some(sensor) = &self.supply_voltage_sensor {
            check_calibration(sensor)?;
        }

        if let TripPolicy::Hysteresis { breaker, sensor } = &self.trip_policy {
            let breaker = usize::from(*breaker);
            if breaker >= self.breakers.len() {
                return Err(ConfigError::MonitoredBreakerMissing(breaker));
            }
            check_calibration(sensor)?;
            match self.hysteresis {
                Some(band) if HysteresisBand::new(band.high, band.low).is_some() => {}
                _ => return Err(ConfigError::InvalidHysteresis),
            }
        }

        Ok(())
    }

    pub fn build_hierarchy(&self) -> BreakerHierarchy {
        let breakers = self.breakers.iter().enumerate().map(|(index, cfg)| {
            let mut breaker = Breaker::new(index as u8, &cfg.name, cfg.drive_pin);
            breaker.is_on = cfg.initial_on;
            breaker.max_current = cfg.max_current;
            breaker.min_current = cfg.min_current;
            breaker
        });
        let hierarchy = BreakerHierarchy::new(breakers, self.polarity);
        match self.hysteresis {
            Some(band) => hierarchy.with_band(band),
            None => hierarchy,
        }
    }

    pub fn build_sensor_bank(&self) -> SensorBank {
        let mut bank = SensorBank::new();
        if let Some(channel) = self.system_current_sensor {
            bank = bank.with_system_current(channel);
        }
        for (index, breaker) in self.breakers.iter().enumerate() {
            if let Some(channel) = breaker.load_sensor {
                bank = bank.with_load_current(index, channel);
            }
        }
        if let TripPolicy::Hysteresis { sensor, .. } = self.trip_policy {
            bank = bank.with_voltage(sensor);
        }
        if let Some(channel) = self.supply_voltage_sensor {
            bank = bank.with_supply_voltage(channel);
        }
        bank
    }
}

fn check_calibration(sensor: &SensorChannel) -> Result<(), ConfigError> {
    if sensor.calibration.is_valid() {
        Ok(())
    } else {
        Err(ConfigError::InvalidCalibration(sensor.pin))
    }
}

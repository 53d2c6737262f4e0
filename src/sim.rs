//! Simulated plant: a board whose analog inputs respond to its own outputs.
//!
//! Each load draws its configured demand only while both the overall breaker
//! and its own breaker are energized. The system sensor sees the sum of every
//! flowing load. Raw samples are synthesized by inverting each channel's
//! calibration, so the controller reads back the physical value it would see
//! on real hardware, quantized to the ADC step.

use crate::breaker::{DrivePolarity, MAX_BREAKERS};
use crate::config::PanelConfig;
use crate::hal::{Actuator, PinLevel, SensorSource};
use crate::safety::TripPolicy;
use crate::sensor::SensorChannel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

pub const DEFAULT_RAIL_VOLTAGE_V: f32 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulatedLoad {
    pub drive_pin: u8,
    pub demand_amps: f32,
    pub sensor: Option<SensorChannel>,
}

#[derive(Debug, Clone)]
pub struct SimulatedPlant {
    polarity: DrivePolarity,
    root_pin: u8,
    loads: heapless::Vec<SimulatedLoad, MAX_BREAKERS>,
    system_sensor: Option<SensorChannel>,
    voltage_sensor: Option<SensorChannel>,
    supply_voltage: f32,
    rail_sensor: Option<SensorChannel>,
    rail_voltage: f32,
    pins: BTreeMap<u8, PinLevel>,
    pin_writes: u64,
}

impl SimulatedPlant {
    /// Mirror the wiring described by `config`. Breaker 0 is the overall
    /// breaker; every other breaker becomes a load with zero demand.
    pub fn from_config(config: &PanelConfig) -> Self {
        let root_pin = config.breakers.first().map_or(0, |b| b.drive_pin);
        let mut loads = heapless::Vec::new();
        for breaker in config.breakers.iter().take(MAX_BREAKERS) {
            let _ = loads.push(SimulatedLoad {
                drive_pin: breaker.drive_pin,
                demand_amps: 0.0,
                sensor: breaker.load_sensor,
            });
        }
        let voltage_sensor = match config.trip_policy {
            TripPolicy::Hysteresis { sensor, .. } => Some(sensor),
            TripPolicy::CurrentWindow { .. } => None,
        };

        Self {
            polarity: config.polarity,
            root_pin,
            loads,
            system_sensor: config.system_current_sensor,
            voltage_sensor,
            supply_voltage: 0.0,
            rail_sensor: config.supply_voltage_sensor,
            rail_voltage: DEFAULT_RAIL_VOLTAGE_V,
            pins: BTreeMap::new(),
            pin_writes: 0,
        }
    }

    /// Current drawn by breaker `index` while it is energized. Index 0 and
    /// unknown indices are ignored.
    pub fn set_load_demand(&mut self, index: usize, amps: f32) {
        if index == 0 {
            return;
        }
        if let Some(load) = self.loads.get_mut(index) {
            load.demand_amps = amps.max(0.0);
        }
    }

    pub fn set_supply_voltage(&mut self, volts: f32) {
        self.supply_voltage = volts.max(0.0);
    }

    pub fn supply_voltage(&self) -> f32 {
        self.supply_voltage
    }

    /// Controller supply rail seen by the optional supply-voltage channel.
    pub fn set_rail_voltage(&mut self, volts: f32) {
        self.rail_voltage = volts.max(0.0);
    }

    pub fn pin_level(&self, pin: u8) -> Option<PinLevel> {
        self.pins.get(&pin).copied()
    }

    pub fn pin_writes(&self) -> u64 {
        self.pin_writes
    }

    fn pin_energized(&self, pin: u8) -> bool {
        self.pin_level(pin) == Some(self.polarity.level_for(true))
    }

    /// Whether breaker `index` currently conducts, judged by its driven pin.
    pub fn is_energized(&self, index: usize) -> bool {
        self.loads
            .get(index)
            .map_or(false, |load| self.pin_energized(load.drive_pin))
    }

    /// Current actually flowing through breaker `index`.
    pub fn load_current(&self, index: usize) -> f32 {
        if index == 0 || !self.pin_energized(self.root_pin) || !self.is_energized(index) {
            return 0.0;
        }
        self.loads.get(index).map_or(0.0, |load| load.demand_amps)
    }

    pub fn system_current(&self) -> f32 {
        (1..self.loads.len()).map(|index| self.load_current(index)).sum()
    }
}

impl SensorSource for SimulatedPlant {
    fn read_raw(&mut self, pin: u8) -> u16 {
        if let Some(sensor) = self.voltage_sensor.filter(|s| s.pin == pin) {
            return sensor.calibration.to_raw(self.supply_voltage);
        }
        if let Some(sensor) = self.rail_sensor.filter(|s| s.pin == pin) {
            return sensor.calibration.to_raw(self.rail_voltage);
        }
        if let Some(sensor) = self.system_sensor.filter(|s| s.pin == pin) {
            return sensor.calibration.to_raw(self.system_current());
        }
        let load = self
            .loads
            .iter()
            .enumerate()
            .find_map(|(index, load)| load.sensor.filter(|s| s.pin == pin).map(|s| (index, s)));
        match load {
            Some((index, sensor)) => sensor.calibration.to_raw(self.load_current(index)),
            None => 0,
        }
    }
}

impl Actuator for SimulatedPlant {
    fn drive(&mut self, pin: u8, level: PinLevel) {
        trace!(pin, ?level, "pin driven");
        self.pins.insert(pin, level);
        self.pin_writes += 1;
    }
}

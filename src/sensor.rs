use crate::breaker::MAX_BREAKERS;
use crate::hal::SensorSource;
use serde::{Deserialize, Serialize};

/// Upper bound of a 10-bit ADC sample.
pub const ADC_MAX_RAW: u16 = 1023;

// ACS712-20A on a 5V reference
pub const ACS712_OFFSET_V: f32 = 2.5;
pub const ACS712_SENSITIVITY_V_PER_A: f32 = 0.100;
pub const DEFAULT_VREF_V: f32 = 5.0;
pub const DEFAULT_FULL_SCALE: f32 = 1024.0;

// Resistive divider used on the voltage-monitor board
pub const DIVIDER_SLOPE: f32 = 0.02445;
pub const DIVIDER_INTERCEPT: f32 = 0.0;

/// Linear transform from a raw sample to a physical value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Calibration {
    /// `raw * slope + intercept`
    Linear { slope: f32, intercept: f32 },
    /// `|((raw / full_scale) * vref - offset) / sensitivity|`, the Hall-effect
    /// current sensor form.
    Ratiometric {
        offset: f32,
        sensitivity: f32,
        vref: f32,
        full_scale: f32,
    },
}

impl Calibration {
    pub const fn acs712() -> Self {
        Calibration::Ratiometric {
            offset: ACS712_OFFSET_V,
            sensitivity: ACS712_SENSITIVITY_V_PER_A,
            vref: DEFAULT_VREF_V,
            full_scale: DEFAULT_FULL_SCALE,
        }
    }

    pub const fn voltage_divider() -> Self {
        Calibration::Linear {
            slope: DIVIDER_SLOPE,
            intercept: DIVIDER_INTERCEPT,
        }
    }

    pub fn apply(&self, raw: u16) -> f32 {
        let raw = f32::from(raw);
        match *self {
            Calibration::Linear { slope, intercept } => raw * slope + intercept,
            Calibration::Ratiometric { offset, sensitivity, vref, full_scale } => {
                (((raw / full_scale) * vref - offset) / sensitivity).abs()
            }
        }
    }

    /// Smallest raw sample whose calibrated value reaches `value`.
    ///
    /// Used to synthesize ADC input. The ratiometric form takes the branch
    /// above the zero-current offset; results are clamped to the ADC range.
    pub fn to_raw(&self, value: f32) -> u16 {
        let raw = match *self {
            Calibration::Linear { slope, intercept } => {
                if slope == 0.0 {
                    return 0;
                }
                (value - intercept) / slope
            }
            Calibration::Ratiometric { offset, sensitivity, vref, full_scale } => {
                (value.abs() * sensitivity + offset) / vref * full_scale
            }
        };
        // f32 noise must not push an exact hit to the next sample
        let raw = (raw - 1e-3).ceil();
        raw.clamp(0.0, f32::from(ADC_MAX_RAW)) as u16
    }

    pub fn is_valid(&self) -> bool {
        match *self {
            Calibration::Linear { slope, intercept } => slope.is_finite() && intercept.is_finite(),
            Calibration::Ratiometric { offset, sensitivity, vref, full_scale } => {
                offset.is_finite()
                    && sensitivity.is_finite()
                    && sensitivity != 0.0
                    && vref > 0.0
                    && full_scale > 0.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorChannel {
    pub pin: u8,
    pub calibration: Calibration,
}

impl SensorChannel {
    pub const fn new(pin: u8, calibration: Calibration) -> Self {
        Self { pin, calibration }
    }

    pub fn read<S: SensorSource + ?Sized>(&self, source: &mut S) -> f32 {
        self.calibration.apply(source.read_raw(self.pin))
    }
}

/// One tick's worth of physical values. Unsensed slots read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Readings {
    pub system_current: f32,
    pub load_current: [f32; MAX_BREAKERS],
    pub voltage: f32,
    /// Controller supply rail, reported alongside `voltage` but never acted on.
    #[serde(default)]
    pub supply_voltage: f32,
}

impl Readings {
    pub fn load(&self, index: usize) -> f32 {
        self.load_current.get(index).copied().unwrap_or(0.0)
    }
}

/// Every sensor channel the deployment wires up.
#[derive(Debug, Clone, Default)]
pub struct SensorBank {
    system_current: Option<SensorChannel>,
    load_current: [Option<SensorChannel>; MAX_BREAKERS],
    voltage: Option<SensorChannel>,
    supply_voltage: Option<SensorChannel>,
}

impl SensorBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_current(mut self, channel: SensorChannel) -> Self {
        self.system_current = Some(channel);
        self
    }

    pub fn with_voltage(mut self, channel: SensorChannel) -> Self {
        self.voltage = Some(channel);
        self
    }

    pub fn with_supply_voltage(mut self, channel: SensorChannel) -> Self {
        self.supply_voltage = Some(channel);
        self
    }

    /// Attach a load-current channel to breaker `index`. Out-of-range indices
    /// are ignored.
    pub fn with_load_current(mut self, index: usize, channel: SensorChannel) -> Self {
        if let Some(slot) = self.load_current.get_mut(index) {
            *slot = Some(channel);
        }
        self
    }

    pub fn has_load_sensor(&self, index: usize) -> bool {
        matches!(self.load_current.get(index), Some(Some(_)))
    }

    pub fn sample<S: SensorSource + ?Sized>(&self, source: &mut S) -> Readings {
        let mut readings = Readings::default();

        if let Some(channel) = &self.system_current {
            readings.system_current = channel.read(source);
        }
        for (slot, channel) in readings.load_current.iter_mut().zip(self.load_current.iter()) {
            if let Some(channel) = channel {
                *slot = channel.read(source);
            }
        }
        if let Some(channel) = &self.voltage {
            readings.voltage = channel.read(source);
        }
        if let Some(channel) = &self.supply_voltage {
            readings.supply_voltage = channel.read(source);
        }

        readings
    }
}

//! Breaker hierarchy: one overall (root) breaker gating N-1 load breakers.
//!
//! Invariant: no load breaker is ever on while the root is off. Every
//! mutation goes through [`BreakerHierarchy::set_state`] (or the trip/reclose
//! helpers built on it), so the invariant holds after every call.

use crate::hal::{Actuator, PinLevel};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Status mask is one byte on the wire.
pub const MAX_BREAKERS: usize = 8;
pub const ROOT_INDEX: usize = 0;

/// Which physical level energizes a breaker.
///
/// The original boards drive PNP stages low-to-conduct (`ActiveLow`); a
/// logic-level N-MOSFET stage conducts on `ActiveHigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrivePolarity {
    ActiveHigh,
    ActiveLow,
}

impl DrivePolarity {
    pub fn level_for(self, on: bool) -> PinLevel {
        match (self, on) {
            (DrivePolarity::ActiveHigh, true) | (DrivePolarity::ActiveLow, false) => PinLevel::High,
            (DrivePolarity::ActiveHigh, false) | (DrivePolarity::ActiveLow, true) => PinLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdKind {
    MaxCurrent,
    MinCurrent,
    HighVoltage,
    LowVoltage,
}

/// Voltage hysteresis pair. `high > low` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisBand {
    pub high: f32,
    pub low: f32,
}

impl HysteresisBand {
    pub fn new(high: f32, low: f32) -> Option<Self> {
        if high.is_finite() && low.is_finite() && high > low {
            Some(Self { high, low })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    pub index: u8,
    pub name: alloc::string::String,
    pub drive_pin: u8,
    pub is_on: bool,
    pub max_current: Option<f32>,
    pub min_current: Option<f32>,
    pub trip_latched: bool,
}

impl Breaker {
    pub fn new(index: u8, name: &str, drive_pin: u8) -> Self {
        Self {
            index,
            name: alloc::string::ToString::to_string(name),
            drive_pin,
            is_on: false,
            max_current: None,
            min_current: None,
            trip_latched: false,
        }
    }

    pub fn with_current_window(mut self, max: f32, min: f32) -> Self {
        self.max_current = Some(max);
        self.min_current = Some(min);
        self
    }

    pub fn is_root(&self) -> bool {
        usize::from(self.index) == ROOT_INDEX
    }
}

/// `max > min >= 0`, with either side allowed to be absent.
pub fn current_window_valid(max: Option<f32>, min: Option<f32>) -> bool {
    let max_ok = max.map_or(true, |m| m.is_finite() && m > 0.0);
    let min_ok = min.map_or(true, |m| m.is_finite() && m >= 0.0);
    let ordered = match (max, min) {
        (Some(max), Some(min)) => max > min,
        _ => true,
    };
    max_ok && min_ok && ordered
}

#[derive(Debug, Clone)]
pub struct BreakerHierarchy {
    breakers: Vec<Breaker, MAX_BREAKERS>,
    polarity: DrivePolarity,
    band: Option<HysteresisBand>,
}

impl BreakerHierarchy {
    /// Build from breakers listed root-first. Extra breakers beyond
    /// [`MAX_BREAKERS`] are dropped; indices are reassigned by position.
    pub fn new<I>(breakers: I, polarity: DrivePolarity) -> Self
    where
        I: IntoIterator<Item = Breaker>,
    {
        let mut list = Vec::new();
        for (position, mut breaker) in breakers.into_iter().take(MAX_BREAKERS).enumerate() {
            breaker.index = position as u8;
            if breaker.is_root() {
                breaker.max_current = None;
                breaker.min_current = None;
            }
            let _ = list.push(breaker);
        }

        // Gate any child configured on under a root that starts off.
        let root_on = list.first().map_or(false, |b: &Breaker| b.is_on);
        if !root_on {
            for breaker in list.iter_mut().skip(1) {
                breaker.is_on = false;
            }
        }

        Self {
            breakers: list,
            polarity,
            band: None,
        }
    }

    pub fn with_band(mut self, band: HysteresisBand) -> Self {
        self.band = Some(band);
        self
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn polarity(&self) -> DrivePolarity {
        self.polarity
    }

    pub fn band(&self) -> Option<HysteresisBand> {
        self.band
    }

    pub fn get(&self, index: usize) -> Option<&Breaker> {
        self.breakers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breaker> {
        self.breakers.iter()
    }

    pub fn is_on(&self, index: usize) -> bool {
        self.breakers.get(index).map_or(false, |b| b.is_on)
    }

    pub fn root_is_on(&self) -> bool {
        self.is_on(ROOT_INDEX)
    }

    pub fn is_load_index(&self, index: usize) -> bool {
        index != ROOT_INDEX && index < self.breakers.len()
    }

    /// Bit `i` set iff breaker `i` is on.
    pub fn status_mask(&self) -> u8 {
        self.breakers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_on)
            .fold(0u8, |mask, (i, _)| mask | (1 << i))
    }

    /// Request a breaker state. Returns whether the request was applied.
    ///
    /// Turning the root off forces every load breaker off with it. A load
    /// breaker is refused while the root is off.
    pub fn set_state<A: Actuator + ?Sized>(&mut self, index: usize, on: bool, actuator: &mut A) -> bool {
        if index >= self.breakers.len() {
            debug!(index, "set_state ignored: no such breaker");
            return false;
        }

        if index == ROOT_INDEX {
            self.write(ROOT_INDEX, on, actuator);
            if !on {
                for child in 1..self.breakers.len() {
                    self.write(child, false, actuator);
                }
            }
        } else {
            if on && !self.root_is_on() {
                debug!(index, "set_state refused: overall breaker is off");
                return false;
            }
            self.write(index, on, actuator);
        }

        debug_assert!(
            self.root_is_on() || self.breakers.iter().skip(1).all(|b| !b.is_on),
            "load breaker energized while overall breaker is off"
        );
        true
    }

    /// Explicit operator command. A successful turn-on clears any trip latch.
    pub fn command_state<A: Actuator + ?Sized>(&mut self, index: usize, on: bool, actuator: &mut A) -> bool {
        let applied = self.set_state(index, on, actuator);
        if applied && on {
            self.breakers[index].trip_latched = false;
        }
        applied
    }

    /// Automatic open. The latch stays set until an operator turns the
    /// breaker back on.
    pub fn trip<A: Actuator + ?Sized>(&mut self, index: usize, actuator: &mut A) -> bool {
        let applied = self.set_state(index, false, actuator);
        if applied {
            self.breakers[index].trip_latched = true;
        }
        applied
    }

    /// Automatic re-close after a voltage recovery.
    pub fn reclose<A: Actuator + ?Sized>(&mut self, index: usize, actuator: &mut A) -> bool {
        let applied = self.set_state(index, true, actuator);
        if applied {
            self.breakers[index].trip_latched = false;
        }
        applied
    }

    /// Update a threshold. Current thresholds apply to load breakers only;
    /// voltage thresholds update the hysteresis band and require a valid
    /// breaker index. Changes that would break `max > min >= 0` or
    /// `high > low` are refused.
    pub fn set_threshold(&mut self, index: usize, kind: ThresholdKind, value: f32) -> bool {
        if index >= self.breakers.len() || !value.is_finite() {
            return false;
        }

        match kind {
            ThresholdKind::MaxCurrent | ThresholdKind::MinCurrent => {
                if index == ROOT_INDEX {
                    return false;
                }
                let breaker = &mut self.breakers[index];
                let (max, min) = match kind {
                    ThresholdKind::MaxCurrent => (Some(value), breaker.min_current),
                    _ => (breaker.max_current, Some(value)),
                };
                if !current_window_valid(max, min) {
                    debug!(index, ?kind, value, "threshold refused: window would be empty");
                    return false;
                }
                breaker.max_current = max;
                breaker.min_current = min;
                true
            }
            ThresholdKind::HighVoltage | ThresholdKind::LowVoltage => {
                let Some(band) = self.band else {
                    return false;
                };
                let candidate = match kind {
                    ThresholdKind::HighVoltage => HysteresisBand::new(value, band.low),
                    _ => HysteresisBand::new(band.high, value),
                };
                match candidate {
                    Some(band) => {
                        self.band = Some(band);
                        true
                    }
                    None => {
                        debug!(index, ?kind, value, "threshold refused: band would collapse");
                        false
                    }
                }
            }
        }
    }

    /// Re-assert every output to match logical state.
    pub fn drive_all<A: Actuator + ?Sized>(&self, actuator: &mut A) {
        for breaker in &self.breakers {
            actuator.drive(breaker.drive_pin, self.polarity.level_for(breaker.is_on));
        }
    }

    pub fn snapshot(&self) -> alloc::vec::Vec<Breaker> {
        self.breakers.iter().cloned().collect()
    }

    fn write<A: Actuator + ?Sized>(&mut self, index: usize, on: bool, actuator: &mut A) {
        let breaker = &mut self.breakers[index];
        breaker.is_on = on;
        actuator.drive(breaker.drive_pin, self.polarity.level_for(on));
    }
}

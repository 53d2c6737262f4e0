use crate::breaker::{BreakerHierarchy, MAX_BREAKERS};
use crate::hal::Actuator;
use crate::sensor::{Readings, SensorChannel};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const MAX_TRIP_HISTORY: usize = 32;

/// Automatic protection strategy for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TripPolicy {
    /// Single breaker driven open by over-voltage and re-closed once the
    /// voltage falls back through the low threshold. The band itself lives in
    /// the hierarchy so it can be retuned at runtime.
    Hysteresis { breaker: u8, sensor: SensorChannel },
    /// Per-load current limits. Trips latch: only an operator re-closes.
    /// With `windowed`, a load drawing below its minimum also trips.
    CurrentWindow { windowed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripCause {
    OverCurrent,
    UnderCurrent,
    OverVoltage,
    VoltageRecovered,
}

impl TripCause {
    pub fn opens_breaker(self) -> bool {
        !matches!(self, TripCause::VoltageRecovered)
    }

    pub fn describe(self) -> &'static str {
        match self {
            TripCause::OverCurrent => "over-current",
            TripCause::UnderCurrent => "under-current",
            TripCause::OverVoltage => "over-voltage",
            TripCause::VoltageRecovered => "voltage recovered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub breaker: u8,
    pub cause: TripCause,
    pub value: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub timestamp_ms: u64,
    pub event: TripEvent,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TripStats {
    pub over_current_trips: u32,
    pub under_current_trips: u32,
    pub over_voltage_trips: u32,
    pub recloses: u32,
    pub evaluations: u64,
}

pub type TripEvents = Vec<TripEvent, MAX_BREAKERS>;

#[derive(Debug)]
pub struct TripEngine {
    policy: TripPolicy,
    tripped: bool,
    history: Vec<TripRecord, MAX_TRIP_HISTORY>,
    stats: TripStats,
}

impl TripEngine {
    pub fn new(policy: TripPolicy) -> Self {
        Self {
            policy,
            tripped: false,
            history: Vec::new(),
            stats: TripStats::default(),
        }
    }

    pub fn policy(&self) -> &TripPolicy {
        &self.policy
    }

    /// Hysteresis latch. Always `false` under the current-window policy,
    /// whose latches live on the breakers themselves.
    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Run one evaluation against this tick's readings.
    pub fn evaluate<A: Actuator + ?Sized>(
        &mut self,
        now_ms: u64,
        readings: &Readings,
        hierarchy: &mut BreakerHierarchy,
        actuator: &mut A,
    ) -> TripEvents {
        self.stats.evaluations = self.stats.evaluations.wrapping_add(1);

        let events = match self.policy {
            TripPolicy::Hysteresis { breaker, .. } => {
                self.evaluate_hysteresis(usize::from(breaker), readings.voltage, hierarchy, actuator)
            }
            TripPolicy::CurrentWindow { windowed } => {
                Self::evaluate_current_window(windowed, readings, hierarchy, actuator)
            }
        };

        for event in &events {
            self.record(now_ms, *event);
        }
        events
    }

    /// An operator toggle of the monitored breaker takes it out of the
    /// engine's hands. Only a breaker the engine opened itself is ever
    /// re-closed, so a manual open stays open and a manual close re-arms.
    pub fn on_operator_command(&mut self, index: usize) {
        if let TripPolicy::Hysteresis { breaker, .. } = self.policy {
            if usize::from(breaker) == index {
                self.tripped = false;
            }
        }
    }

    fn evaluate_hysteresis<A: Actuator + ?Sized>(
        &mut self,
        index: usize,
        voltage: f32,
        hierarchy: &mut BreakerHierarchy,
        actuator: &mut A,
    ) -> TripEvents {
        let mut events = TripEvents::new();
        let Some(band) = hierarchy.band() else {
            return events;
        };

        let latched = hierarchy.get(index).map_or(false, |b| b.trip_latched);

        if !self.tripped && hierarchy.is_on(index) && voltage >= band.high {
            if !hierarchy.trip(index, actuator) {
                return events;
            }
            self.tripped = true;
            let _ = events.push(TripEvent {
                breaker: index as u8,
                cause: TripCause::OverVoltage,
                value: voltage,
                threshold: band.high,
            });
        } else if self.tripped && voltage <= band.low {
            self.tripped = false;
            if !latched || !hierarchy.reclose(index, actuator) {
                return events;
            }
            let _ = events.push(TripEvent {
                breaker: index as u8,
                cause: TripCause::VoltageRecovered,
                value: voltage,
                threshold: band.low,
            });
        }

        events
    }

    fn evaluate_current_window<A: Actuator + ?Sized>(
        windowed: bool,
        readings: &Readings,
        hierarchy: &mut BreakerHierarchy,
        actuator: &mut A,
    ) -> TripEvents {
        let mut events = TripEvents::new();

        for index in 1..hierarchy.len() {
            let Some(breaker) = hierarchy.get(index) else {
                continue;
            };
            if !breaker.is_on {
                continue;
            }
            let current = readings.load(index);

            let verdict = match (breaker.max_current, breaker.min_current) {
                (Some(max), _) if current >= max => Some((TripCause::OverCurrent, max)),
                (_, Some(min)) if windowed && current > 0.0 && current < min => {
                    Some((TripCause::UnderCurrent, min))
                }
                _ => None,
            };

            if let Some((cause, threshold)) = verdict {
                if hierarchy.trip(index, actuator) {
                    let _ = events.push(TripEvent {
                        breaker: index as u8,
                        cause,
                        value: current,
                        threshold,
                    });
                }
            }
        }

        events
    }

    fn record(&mut self, now_ms: u64, event: TripEvent) {
        match event.cause {
            TripCause::OverCurrent => self.stats.over_current_trips += 1,
            TripCause::UnderCurrent => self.stats.under_current_trips += 1,
            TripCause::OverVoltage => self.stats.over_voltage_trips += 1,
            TripCause::VoltageRecovered => self.stats.recloses += 1,
        }

        if event.cause.opens_breaker() {
            warn!(
                breaker = event.breaker,
                cause = event.cause.describe(),
                value = event.value,
                threshold = event.threshold,
                "breaker tripped"
            );
        } else {
            info!(breaker = event.breaker, value = event.value, "breaker re-closed");
        }

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(TripRecord {
            timestamp_ms: now_ms,
            event,
        });
    }

    pub fn get_history(&self) -> &[TripRecord] {
        &self.history
    }

    pub fn get_stats(&self) -> &TripStats {
        &self.stats
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

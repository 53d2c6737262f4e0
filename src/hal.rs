//! Capabilities the controller consumes from the board it runs on.
//!
//! ADC sampling, pin output, the serial link and the clock all live outside
//! this crate. The control loop only ever talks to them through these traits,
//! which keeps every decision testable against synthetic inputs.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::time::Instant;

/// Physical level written to an output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinLevel {
    Low,
    High,
}

/// Raw analog acquisition, e.g. a 10-bit ADC returning `0..=1023`.
pub trait SensorSource {
    fn read_raw(&mut self, pin: u8) -> u16;
}

/// Pin output used to drive breaker transistors / MOSFETs.
pub trait Actuator {
    fn drive(&mut self, pin: u8, level: PinLevel);
}

/// Duplex byte link to the supervising application.
///
/// Reads never block: `read` returns `nb::Error::WouldBlock` when nothing is
/// buffered, and `bytes_available` can be queried without consuming input.
pub trait ByteChannel {
    type Error: core::fmt::Debug;

    fn bytes_available(&self) -> usize;
    fn read(&mut self) -> nb::Result<u8, Self::Error>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// `Clock` backed by `std::time::Instant`, counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for tests and deterministic replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: Cell::new(start_ms) }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get().saturating_add(ms));
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.set(ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

//! # Breaker Panel
//!
//! Control and telemetry engine for a small hierarchical breaker panel: one
//! overall breaker gating a handful of load breakers, automatic protection on
//! measured current or voltage, and a compact serial protocol to a supervising
//! application.
//!
//! ## Quick Start
//!
//! ```rust
//! use breaker_panel::{BufferedChannel, ControlLoop, ManualClock, PanelConfig, SimulatedPlant};
//!
//! let config = PanelConfig::default();
//! let clock = ManualClock::new(0);
//! let plant = SimulatedPlant::from_config(&config);
//! let mut control = ControlLoop::new(&config, plant, BufferedChannel::new(), &clock).unwrap();
//!
//! control.channel_mut().inject(b"T,0,1\nT,1,1\n").unwrap();
//! clock.advance(100);
//! let report = control.tick();
//! assert_eq!(report.status_mask, 0b011);
//! ```
//!
//! ## Architecture
//!
//! - [`hal`] - capabilities consumed from the board (ADC, pins, serial, clock)
//! - [`sensor`] - raw sample calibration
//! - [`breaker`] - breaker hierarchy and its invariant
//! - [`safety`] - auto-trip policies
//! - [`protocol`] - inbound command codec, text and binary
//! - [`telemetry`] - outbound status frames
//! - [`control`] - the per-tick control loop
//! - [`config`] - deployment configuration
//! - [`channel`], [`sim`] - in-memory link and simulated plant

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod breaker;
pub mod channel;
pub mod config;
pub mod control;
pub mod hal;
pub mod protocol;
pub mod safety;
pub mod sensor;
pub mod sim;
pub mod telemetry;

pub use breaker::{Breaker, BreakerHierarchy, DrivePolarity, ThresholdKind};
pub use channel::BufferedChannel;
pub use config::{ConfigError, PanelConfig};
pub use control::{ControlLoop, ControlStats, TickReport};
pub use hal::{Actuator, ByteChannel, Clock, ManualClock, MonotonicClock, PinLevel, SensorSource};
pub use protocol::{Command, CommandDecoder, ProtocolError, WireFormat};
pub use safety::{TripEngine, TripEvent, TripPolicy};
pub use sensor::{Calibration, Readings, SensorChannel};
pub use sim::SimulatedPlant;
pub use telemetry::{TelemetryDecoder, TelemetryFrame};

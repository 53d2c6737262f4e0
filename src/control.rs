//! The control loop: drain inbound commands, run auto-trip, emit telemetry.
//!
//! `tick` is synchronous and run-to-completion. The loop owns every piece of
//! mutable state; callers only reach it through the accessors below.

use crate::breaker::{BreakerHierarchy, ThresholdKind};
use crate::config::{ConfigError, PanelConfig};
use crate::hal::{Actuator, ByteChannel, Clock, SensorSource};
use crate::protocol::{Command, CommandDecoder, WireFormat};
use crate::safety::{TripEngine, TripEvents, TripPolicy};
use crate::sensor::{Readings, SensorBank};
use crate::telemetry::{
    format_trip_notice, format_voltage_report, LoadFieldFill, TelemetryFrame, TelemetryScheduler,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Upper bound on inbound bytes consumed per tick.
pub const MAX_BYTES_PER_TICK: usize = 256;

/// What happened during one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub now_ms: u64,
    pub bytes_read: usize,
    pub commands_applied: u32,
    pub commands_refused: u32,
    pub frames_dropped: u32,
    pub trip_events: TripEvents,
    pub telemetry_sent: bool,
    pub status_mask: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ControlStats {
    pub ticks: u64,
    pub bytes_read: u64,
    pub commands_applied: u32,
    pub commands_refused: u32,
    pub frames_dropped: u32,
    pub trips: u32,
    pub telemetry_frames: u32,
    pub channel_errors: u32,
    pub last_readings: Readings,
}

pub struct ControlLoop<IO, CH, CL>
where
    IO: SensorSource + Actuator,
    CH: ByteChannel,
    CL: Clock,
{
    hierarchy: BreakerHierarchy,
    sensors: SensorBank,
    engine: TripEngine,
    decoder: CommandDecoder,
    scheduler: TelemetryScheduler,
    format: WireFormat,
    load_fill: LoadFieldFill,
    announce_trips: bool,
    report_voltage: bool,
    io: IO,
    channel: CH,
    clock: CL,
    stats: ControlStats,
}

impl<IO, CH, CL> ControlLoop<IO, CH, CL>
where
    IO: SensorSource + Actuator,
    CH: ByteChannel,
    CL: Clock,
{
    /// Validate `config`, then drive every output to its configured state.
    pub fn new(config: &PanelConfig, mut io: IO, channel: CH, clock: CL) -> Result<Self, ConfigError> {
        config.validate()?;

        let hierarchy = config.build_hierarchy();
        hierarchy.drive_all(&mut io);

        let now = clock.now_ms();
        info!(
            breakers = hierarchy.len(),
            format = ?config.wire_format,
            policy = ?config.trip_policy,
            status_mask = hierarchy.status_mask(),
            "control loop started"
        );

        Ok(Self {
            sensors: config.build_sensor_bank(),
            engine: TripEngine::new(config.trip_policy),
            decoder: CommandDecoder::new(config.wire_format),
            scheduler: TelemetryScheduler::new(config.telemetry.interval_ms, now),
            format: config.wire_format,
            load_fill: config.load_fill(),
            announce_trips: config.telemetry.announce_trips,
            report_voltage: config.telemetry.report_voltage,
            hierarchy,
            io,
            channel,
            clock,
            stats: ControlStats::default(),
        })
    }

    pub fn tick(&mut self) -> TickReport {
        let now_ms = self.clock.now_ms();
        let mut report = TickReport {
            now_ms,
            ..TickReport::default()
        };

        self.drain_commands(&mut report);

        let readings = self.sensors.sample(&mut self.io);
        report.trip_events = self
            .engine
            .evaluate(now_ms, &readings, &mut self.hierarchy, &mut self.io);

        if self.announce_trips && self.format == WireFormat::Text {
            for event in &report.trip_events {
                match format_trip_notice(event) {
                    Ok(line) => {
                        self.write(line.as_bytes());
                    }
                    Err(e) => debug!(error = %e, "trip notice not encoded"),
                }
            }
        }

        report.status_mask = self.hierarchy.status_mask();

        if self.scheduler.is_due(now_ms) {
            self.send_telemetry(&mut report, &readings);
            // Consumed whether or not the frame went out
            self.scheduler.mark_sent(now_ms);
        }

        self.stats.ticks += 1;
        self.stats.bytes_read += report.bytes_read as u64;
        self.stats.commands_applied += report.commands_applied;
        self.stats.commands_refused += report.commands_refused;
        self.stats.frames_dropped += report.frames_dropped;
        self.stats.trips += report
            .trip_events
            .iter()
            .filter(|e| e.cause.opens_breaker())
            .count() as u32;
        if report.telemetry_sent {
            self.stats.telemetry_frames += 1;
        }
        self.stats.last_readings = readings;

        report
    }

    fn drain_commands(&mut self, report: &mut TickReport) {
        while report.bytes_read < MAX_BYTES_PER_TICK && self.channel.bytes_available() > 0 {
            let byte = match self.channel.read() {
                Ok(byte) => byte,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    warn!(error = ?e, "channel read failed");
                    self.stats.channel_errors += 1;
                    break;
                }
            };
            report.bytes_read += 1;

            match self.decoder.push(byte) {
                None => {}
                Some(Ok(command)) => {
                    if self.apply(command) {
                        report.commands_applied += 1;
                    } else {
                        report.commands_refused += 1;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "inbound frame dropped");
                    report.frames_dropped += 1;
                }
            }
        }
    }

    fn send_telemetry(&mut self, report: &mut TickReport, readings: &Readings) {
        let frame = TelemetryFrame::from_readings(report.status_mask, readings, self.load_fill);
        match frame.encode(self.format) {
            Ok(bytes) => report.telemetry_sent = self.write(&bytes),
            Err(e) => {
                warn!(error = %e, "telemetry frame not encoded");
                return;
            }
        }

        if self.report_voltage && self.format == WireFormat::Text {
            match format_voltage_report(readings) {
                Ok(line) => {
                    self.write(line.as_bytes());
                }
                Err(e) => debug!(error = %e, "voltage report not encoded"),
            }
        }
    }

    fn apply(&mut self, command: Command) -> bool {
        let applied = match command {
            Command::Toggle { index, on } => {
                let index = usize::from(index);
                let applied = self.hierarchy.command_state(index, on, &mut self.io);
                if applied {
                    self.engine.on_operator_command(index);
                }
                applied
            }
            Command::SetMaxCurrent { index, amps } => {
                let kind = self.threshold_kind(usize::from(index), ThresholdKind::MaxCurrent);
                self.hierarchy.set_threshold(usize::from(index), kind, amps)
            }
            Command::SetMinCurrent { index, amps } => {
                let kind = self.threshold_kind(usize::from(index), ThresholdKind::MinCurrent);
                self.hierarchy.set_threshold(usize::from(index), kind, amps)
            }
        };

        if applied {
            info!(?command, status_mask = self.hierarchy.status_mask(), "command applied");
        } else {
            debug!(?command, "command refused");
        }
        applied
    }

    /// Under the hysteresis policy the monitored breaker has no current
    /// window; its max/min commands retune the voltage band instead.
    fn threshold_kind(&self, index: usize, requested: ThresholdKind) -> ThresholdKind {
        match self.engine.policy() {
            TripPolicy::Hysteresis { breaker, .. } if usize::from(*breaker) == index => match requested {
                ThresholdKind::MaxCurrent => ThresholdKind::HighVoltage,
                ThresholdKind::MinCurrent => ThresholdKind::LowVoltage,
                other => other,
            },
            _ => requested,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        match self.channel.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, len = bytes.len(), "channel write failed");
                self.stats.channel_errors += 1;
                false
            }
        }
    }

    pub fn hierarchy(&self) -> &BreakerHierarchy {
        &self.hierarchy
    }

    pub fn engine(&self) -> &TripEngine {
        &self.engine
    }

    pub fn stats(&self) -> &ControlStats {
        &self.stats
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn channel(&self) -> &CH {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CH {
        &mut self.channel
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn clock(&self) -> &CL {
        &self.clock
    }
}

use crate::protocol::{decode_f32, encode_f32, WireFormat, TEXT_TERMINATOR};
use crate::safety::TripEvent;
use crate::sensor::Readings;
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;

pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 100;

// mask + four f32 fields
pub const BINARY_TELEMETRY_LEN: usize = 17;
const_assert_eq!(BINARY_TELEMETRY_LEN, 1 + 4 * core::mem::size_of::<f32>());

// Widest `{:.2}` rendering of an f32: sign, 39 integer digits, point, 2 decimals
pub const MAX_TEXT_FIELD_WIDTH: usize = 43;
pub const MAX_TEXT_TELEMETRY: usize = 192;
// mask, four separated fields, terminator
const_assert!(MAX_TEXT_TELEMETRY >= 3 + 4 * (1 + MAX_TEXT_FIELD_WIDTH) + 1);
pub const FIELD_SEPARATOR: char = '|';
pub const NOTICE_PREFIX: char = '#';

pub type TextTelemetry = ArrayString<MAX_TEXT_TELEMETRY>;
pub type BinaryTelemetry = [u8; BINARY_TELEMETRY_LEN];
pub type EncodedTelemetry = Vec<u8, MAX_TEXT_TELEMETRY>;

/// How the total/load-2 fields are filled.
///
/// Deployed boards have a single load sensor. The binary link mirrors the
/// load-1 reading into the total and load-2 slots; the text link reports
/// the measured sum and an unsensed load 2 as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadFieldFill {
    Measured,
    MirrorLoad1,
}

impl LoadFieldFill {
    pub fn default_for(format: WireFormat) -> Self {
        match format {
            WireFormat::Text => LoadFieldFill::Measured,
            WireFormat::Binary => LoadFieldFill::MirrorLoad1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("wrong frame length {0}")]
    Length(usize),
    #[error("wrong field count")]
    FieldCount,
    #[error("unparsable field")]
    Field,
    #[error("frame too large for buffer")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub status_mask: u8,
    pub system_current: f32,
    pub total_load_current: f32,
    pub load1_current: f32,
    pub load2_current: f32,
}

impl TelemetryFrame {
    pub fn from_readings(status_mask: u8, readings: &Readings, fill: LoadFieldFill) -> Self {
        let load1 = readings.load(1);
        let (total, load2) = match fill {
            LoadFieldFill::Measured => {
                let load2 = readings.load(2);
                (load1 + load2, load2)
            }
            LoadFieldFill::MirrorLoad1 => (load1, load1),
        };

        Self {
            status_mask,
            system_current: readings.system_current,
            total_load_current: total,
            load1_current: load1,
            load2_current: load2,
        }
    }

    pub fn is_on(&self, index: usize) -> bool {
        index < 8 && self.status_mask & (1 << index) != 0
    }

    /// `mask|sys|total|load1|load2`, two decimals, no terminator.
    pub fn encode_text(&self) -> Result<TextTelemetry, TelemetryError> {
        let mut line = TextTelemetry::new();
        core::fmt::write(
            &mut line,
            format_args!(
                "{}|{:.2}|{:.2}|{:.2}|{:.2}",
                self.status_mask,
                self.system_current,
                self.total_load_current,
                self.load1_current,
                self.load2_current
            ),
        )
        .map_err(|_| TelemetryError::Overflow)?;
        Ok(line)
    }

    pub fn encode_binary(&self) -> BinaryTelemetry {
        let mut frame = [0u8; BINARY_TELEMETRY_LEN];
        frame[0] = self.status_mask;
        let fields = [
            self.system_current,
            self.total_load_current,
            self.load1_current,
            self.load2_current,
        ];
        for (chunk, value) in frame[1..].chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&encode_f32(value));
        }
        frame
    }

    /// Wire bytes for `format`, text lines newline-terminated.
    pub fn encode(&self, format: WireFormat) -> Result<EncodedTelemetry, TelemetryError> {
        let mut out = EncodedTelemetry::new();
        match format {
            WireFormat::Text => {
                let line = self.encode_text()?;
                out.extend_from_slice(line.as_bytes())
                    .map_err(|()| TelemetryError::Overflow)?;
                out.push(TEXT_TERMINATOR).map_err(|_| TelemetryError::Overflow)?;
            }
            WireFormat::Binary => {
                out.extend_from_slice(&self.encode_binary())
                    .map_err(|()| TelemetryError::Overflow)?;
            }
        }
        Ok(out)
    }

    pub fn decode_text(line: &str) -> Result<Self, TelemetryError> {
        let mut fields = line.trim().split(FIELD_SEPARATOR);
        let mut next = || fields.next().ok_or(TelemetryError::FieldCount);

        let status_mask = next()?.trim().parse::<u8>().map_err(|_| TelemetryError::Field)?;
        let mut values = [0f32; 4];
        for value in &mut values {
            *value = next()?.trim().parse::<f32>().map_err(|_| TelemetryError::Field)?;
        }
        if fields.next().is_some() {
            return Err(TelemetryError::FieldCount);
        }

        let [system_current, total_load_current, load1_current, load2_current] = values;
        Ok(Self {
            status_mask,
            system_current,
            total_load_current,
            load1_current,
            load2_current,
        })
    }

    pub fn decode_binary(frame: &[u8]) -> Result<Self, TelemetryError> {
        if frame.len() != BINARY_TELEMETRY_LEN {
            return Err(TelemetryError::Length(frame.len()));
        }
        let field = |offset: usize| decode_f32([frame[offset], frame[offset + 1], frame[offset + 2], frame[offset + 3]]);

        Ok(Self {
            status_mask: frame[0],
            system_current: field(1),
            total_load_current: field(5),
            load1_current: field(9),
            load2_current: field(13),
        })
    }
}

/// Human-readable trip notice for the text link, e.g.
/// `# breaker 1 tripped: over-current 5.03`.
pub fn format_trip_notice(event: &TripEvent) -> Result<TextTelemetry, TelemetryError> {
    let mut line = TextTelemetry::new();
    let verb = if event.cause.opens_breaker() { "tripped" } else { "re-closed" };
    core::fmt::write(
        &mut line,
        format_args!(
            "{} breaker {} {}: {} {:.2}\n",
            NOTICE_PREFIX,
            event.breaker,
            verb,
            event.cause.describe(),
            event.value
        ),
    )
    .map_err(|_| TelemetryError::Overflow)?;
    Ok(line)
}

/// Voltage line for the text link, e.g. `# voltage load 4.20 supply 4.98`.
///
/// Carried as a notice so existing frame readers skip it.
pub fn format_voltage_report(readings: &Readings) -> Result<TextTelemetry, TelemetryError> {
    let mut line = TextTelemetry::new();
    core::fmt::write(
        &mut line,
        format_args!(
            "{} voltage load {:.2} supply {:.2}\n",
            NOTICE_PREFIX, readings.voltage, readings.supply_voltage
        ),
    )
    .map_err(|_| TelemetryError::Overflow)?;
    Ok(line)
}

/// Parse a line written by [`format_voltage_report`] into `(load, supply)`.
pub fn parse_voltage_report(line: &str) -> Option<(f32, f32)> {
    let rest = line.trim().strip_prefix(NOTICE_PREFIX)?.trim_start();
    let mut words = rest.strip_prefix("voltage load ")?.split_whitespace();
    let load = words.next()?.parse().ok()?;
    if words.next()? != "supply" {
        return None;
    }
    let supply = words.next()?.parse().ok()?;
    words.next().is_none().then_some((load, supply))
}

/// Decides when the next frame is due.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryScheduler {
    interval_ms: u64,
    last_sent_ms: u64,
    sequence: u32,
}

impl TelemetryScheduler {
    pub fn new(interval_ms: u64, start_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sent_ms: start_ms,
            sequence: 0,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sent_ms) >= self.interval_ms
    }

    pub fn mark_sent(&mut self, now_ms: u64) {
        self.last_sent_ms = now_ms;
        self.sequence = self.sequence.wrapping_add(1);
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn frames_sent(&self) -> u32 {
        self.sequence
    }
}

/// Streaming telemetry reader for the supervising side.
///
/// Binary frames carry no sync marker, so the stream is cut every
/// [`BINARY_TELEMETRY_LEN`] bytes; text lines starting with `#` are notices
/// and are skipped.
#[derive(Debug)]
pub struct TelemetryDecoder {
    format: WireFormat,
    buffer: alloc::vec::Vec<u8>,
}

impl TelemetryDecoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: alloc::vec::Vec::new(),
        }
    }

    /// Bytes of a frame that has started but not yet completed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> alloc::vec::Vec<Result<TelemetryFrame, TelemetryError>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = alloc::vec::Vec::new();

        match self.format {
            WireFormat::Binary => {
                while self.buffer.len() >= BINARY_TELEMETRY_LEN {
                    let frame: alloc::vec::Vec<u8> = self.buffer.drain(..BINARY_TELEMETRY_LEN).collect();
                    frames.push(TelemetryFrame::decode_binary(&frame));
                }
            }
            WireFormat::Text => {
                while let Some(end) = self.buffer.iter().position(|&b| b == TEXT_TERMINATOR) {
                    let line: alloc::vec::Vec<u8> = self.buffer.drain(..=end).collect();
                    let Ok(line) = core::str::from_utf8(&line) else {
                        frames.push(Err(TelemetryError::Field));
                        continue;
                    };
                    let line = line.trim();
                    if line.is_empty() || line.starts_with(NOTICE_PREFIX) {
                        continue;
                    }
                    frames.push(TelemetryFrame::decode_text(line));
                }
            }
        }

        frames
    }
}

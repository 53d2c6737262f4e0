//! Inbound command framing for both wire formats.
//!
//! Text:   `T,<index>,<0|1>\n`, `M,<index>,<amps>\n`, `m,<index>,<amps>\n`
//! Binary: `[0x01, index, state]` and `[0x02, index, f32 LE]`
//!
//! Decoders are fed one byte at a time and only yield a command once a frame
//! is complete, so partial input simply waits for the next tick.

use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_TEXT_LINE: usize = 64;
pub const MAX_COMMAND_FRAME: usize = MAX_TEXT_LINE + 1;

pub const OP_TOGGLE: u8 = 0x01;
pub const OP_SET_MAX_CURRENT: u8 = 0x02;
pub const TOGGLE_FRAME_LEN: usize = 3;
pub const SET_MAX_CURRENT_FRAME_LEN: usize = 6;

pub const TEXT_DELIMITER: char = ',';
pub const TEXT_TERMINATOR: u8 = b'\n';

pub type CommandBytes = Vec<u8, MAX_COMMAND_FRAME>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    Text,
    Binary,
}

impl core::str::FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(WireFormat::Text),
            "binary" => Ok(WireFormat::Binary),
            _ => Err(ProtocolError::Unsupported),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Toggle { index: u8, on: bool },
    SetMaxCurrent { index: u8, amps: f32 },
    SetMinCurrent { index: u8, amps: f32 },
}

impl Command {
    pub fn index(&self) -> usize {
        match *self {
            Command::Toggle { index, .. }
            | Command::SetMaxCurrent { index, .. }
            | Command::SetMinCurrent { index, .. } => usize::from(index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    EmptyLine,
    #[error("missing field delimiter")]
    MissingDelimiter,
    #[error("unknown command type '{0}'")]
    UnknownType(char),
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("invalid breaker index")]
    InvalidIndex,
    #[error("invalid value")]
    InvalidValue,
    #[error("line exceeds maximum length")]
    LineTooLong,
    #[error("frame truncated")]
    Truncated,
    #[error("not supported by this wire format")]
    Unsupported,
}

/// Explicit little-endian float codec; never relies on host layout.
pub fn encode_f32(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn decode_f32(bytes: [u8; 4]) -> f32 {
    f32::from_le_bytes(bytes)
}

/// Parse one complete text line (without terminator).
pub fn parse_text_command(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }

    let mut fields = line.splitn(3, TEXT_DELIMITER);
    let kind = fields.next().ok_or(ProtocolError::MissingDelimiter)?.trim();
    let index = fields.next().ok_or(ProtocolError::MissingDelimiter)?.trim();
    let value = fields.next().ok_or(ProtocolError::MissingDelimiter)?.trim();

    let mut kind_chars = kind.chars();
    let kind = match (kind_chars.next(), kind_chars.next()) {
        (Some(c), None) => c,
        (Some(c), Some(_)) => return Err(ProtocolError::UnknownType(c)),
        (None, _) => return Err(ProtocolError::EmptyLine),
    };

    let index: u8 = index.parse().map_err(|_| ProtocolError::InvalidIndex)?;

    match kind {
        'T' => match value {
            "0" => Ok(Command::Toggle { index, on: false }),
            "1" => Ok(Command::Toggle { index, on: true }),
            _ => Err(ProtocolError::InvalidValue),
        },
        'M' => Ok(Command::SetMaxCurrent { index, amps: parse_amps(value)? }),
        'm' => Ok(Command::SetMinCurrent { index, amps: parse_amps(value)? }),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn parse_amps(value: &str) -> Result<f32, ProtocolError> {
    match value.parse::<f32>() {
        Ok(amps) if amps.is_finite() => Ok(amps),
        _ => Err(ProtocolError::InvalidValue),
    }
}

/// Parse one complete binary frame. `frame.len()` must match the opcode.
pub fn parse_binary_command(frame: &[u8]) -> Result<Command, ProtocolError> {
    let (&opcode, body) = frame.split_first().ok_or(ProtocolError::Truncated)?;
    match opcode {
        OP_TOGGLE => {
            let &[index, state] = body else {
                return Err(ProtocolError::Truncated);
            };
            let on = match state {
                0 => false,
                1 => true,
                _ => return Err(ProtocolError::InvalidValue),
            };
            Ok(Command::Toggle { index, on })
        }
        OP_SET_MAX_CURRENT => {
            let &[index, b0, b1, b2, b3] = body else {
                return Err(ProtocolError::Truncated);
            };
            if index == 0 {
                return Err(ProtocolError::InvalidIndex);
            }
            let amps = decode_f32([b0, b1, b2, b3]);
            if !amps.is_finite() {
                return Err(ProtocolError::InvalidValue);
            }
            Ok(Command::SetMaxCurrent { index, amps })
        }
        other => Err(ProtocolError::UnknownOpcode(other)),
    }
}

fn binary_frame_len(opcode: u8) -> Option<usize> {
    match opcode {
        OP_TOGGLE => Some(TOGGLE_FRAME_LEN),
        OP_SET_MAX_CURRENT => Some(SET_MAX_CURRENT_FRAME_LEN),
        _ => None,
    }
}

/// Client-side encoder, used by the supervising CLI and tests.
pub fn encode_command(format: WireFormat, command: &Command) -> Result<CommandBytes, ProtocolError> {
    let mut out = CommandBytes::new();
    match format {
        WireFormat::Text => {
            let mut line: ArrayString<MAX_TEXT_LINE> = ArrayString::new();
            let written = match *command {
                Command::Toggle { index, on } => {
                    core::fmt::write(&mut line, format_args!("T,{},{}", index, u8::from(on)))
                }
                Command::SetMaxCurrent { index, amps } => {
                    core::fmt::write(&mut line, format_args!("M,{},{}", index, amps))
                }
                Command::SetMinCurrent { index, amps } => {
                    core::fmt::write(&mut line, format_args!("m,{},{}", index, amps))
                }
            };
            written.map_err(|_| ProtocolError::LineTooLong)?;
            out.extend_from_slice(line.as_bytes())
                .map_err(|()| ProtocolError::LineTooLong)?;
            out.push(TEXT_TERMINATOR).map_err(|_| ProtocolError::LineTooLong)?;
        }
        WireFormat::Binary => match *command {
            Command::Toggle { index, on } => {
                out.extend_from_slice(&[OP_TOGGLE, index, u8::from(on)])
                    .map_err(|()| ProtocolError::LineTooLong)?;
            }
            Command::SetMaxCurrent { index, amps } => {
                out.extend_from_slice(&[OP_SET_MAX_CURRENT, index])
                    .map_err(|()| ProtocolError::LineTooLong)?;
                out.extend_from_slice(&encode_f32(amps))
                    .map_err(|()| ProtocolError::LineTooLong)?;
            }
            Command::SetMinCurrent { .. } => return Err(ProtocolError::Unsupported),
        },
    }
    Ok(out)
}

/// Line accumulator for the text format.
#[derive(Debug, Default)]
pub struct TextDecoder {
    line: Vec<u8, MAX_TEXT_LINE>,
    overflowed: bool,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<Result<Command, ProtocolError>> {
        if byte != TEXT_TERMINATOR {
            if self.line.push(byte).is_err() {
                self.overflowed = true;
            }
            return None;
        }

        let outcome = if self.overflowed {
            Some(Err(ProtocolError::LineTooLong))
        } else {
            match core::str::from_utf8(&self.line) {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(parse_text_command(line)),
                Err(_) => Some(Err(ProtocolError::InvalidValue)),
            }
        };
        self.line.clear();
        self.overflowed = false;
        outcome
    }

    pub fn buffered(&self) -> usize {
        self.line.len()
    }
}

/// Fixed-length frame accumulator for the binary format.
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    frame: Vec<u8, SET_MAX_CURRENT_FRAME_LEN>,
}

impl BinaryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<Result<Command, ProtocolError>> {
        if self.frame.is_empty() && binary_frame_len(byte).is_none() {
            // Drop just this byte so the next one can start a frame.
            return Some(Err(ProtocolError::UnknownOpcode(byte)));
        }

        let _ = self.frame.push(byte);
        let expected = binary_frame_len(self.frame[0]).unwrap_or(1);
        if self.frame.len() < expected {
            return None;
        }

        let result = parse_binary_command(&self.frame);
        self.frame.clear();
        Some(result)
    }

    pub fn buffered(&self) -> usize {
        self.frame.len()
    }
}

#[derive(Debug)]
pub enum CommandDecoder {
    Text(TextDecoder),
    Binary(BinaryDecoder),
}

impl CommandDecoder {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Text => CommandDecoder::Text(TextDecoder::new()),
            WireFormat::Binary => CommandDecoder::Binary(BinaryDecoder::new()),
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            CommandDecoder::Text(_) => WireFormat::Text,
            CommandDecoder::Binary(_) => WireFormat::Binary,
        }
    }

    /// Feed one byte. Yields a result only when a frame completes.
    pub fn push(&mut self, byte: u8) -> Option<Result<Command, ProtocolError>> {
        match self {
            CommandDecoder::Text(decoder) => decoder.push(byte),
            CommandDecoder::Binary(decoder) => decoder.push(byte),
        }
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        match self {
            CommandDecoder::Text(decoder) => decoder.buffered(),
            CommandDecoder::Binary(decoder) => decoder.buffered(),
        }
    }
}

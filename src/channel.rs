//! In-memory byte link. The simulator bridges TCP sockets into one of these,
//! and tests use it to play the supervising application.

use crate::hal::ByteChannel;
use std::collections::VecDeque;
use thiserror::Error;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel buffer full")]
    Overflow,
    #[error("channel closed")]
    Closed,
}

#[derive(Debug)]
pub struct BufferedChannel {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    capacity: usize,
    closed: bool,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: Vec::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// Queue bytes as if the peer had sent them.
    pub fn inject(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if self.inbound.len() + bytes.len() > self.capacity {
            return Err(ChannelError::Overflow);
        }
        self.inbound.extend(bytes.iter().copied());
        Ok(())
    }

    /// Everything written by the controller since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.outbound)
    }

    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for BufferedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteChannel for BufferedChannel {
    type Error = ChannelError;

    fn bytes_available(&self) -> usize {
        self.inbound.len()
    }

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        match self.inbound.pop_front() {
            Some(byte) => Ok(byte),
            None if self.closed => Err(nb::Error::Other(ChannelError::Closed)),
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if self.outbound.len() + bytes.len() > self.capacity {
            return Err(ChannelError::Overflow);
        }
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_would_block_when_empty() {
        let mut channel = BufferedChannel::new();
        assert_eq!(channel.bytes_available(), 0);
        assert!(matches!(channel.read(), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn test_inject_then_read_in_order() {
        let mut channel = BufferedChannel::new();
        channel.inject(b"T,1").unwrap();
        assert_eq!(channel.bytes_available(), 3);

        assert_eq!(channel.read().unwrap(), b'T');
        assert_eq!(channel.read().unwrap(), b',');
        assert_eq!(channel.bytes_available(), 1);
        assert_eq!(channel.read().unwrap(), b'1');
    }

    #[test]
    fn test_output_is_drained() {
        let mut channel = BufferedChannel::new();
        channel.write_all(b"3|0.00").unwrap();
        assert_eq!(channel.pending_output(), b"3|0.00");

        assert_eq!(channel.take_output(), b"3|0.00".to_vec());
        assert!(channel.pending_output().is_empty());
    }

    #[test]
    fn test_capacity_enforced() {
        let mut channel = BufferedChannel::with_capacity(4);
        assert_eq!(channel.inject(b"12345"), Err(ChannelError::Overflow));
        assert_eq!(channel.write_all(b"12345"), Err(ChannelError::Overflow));
        assert!(channel.inject(b"1234").is_ok());
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let mut channel = BufferedChannel::new();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(channel.read(), Err(nb::Error::Other(ChannelError::Closed))));
        assert_eq!(channel.write_all(b"x"), Err(ChannelError::Closed));
    }
}

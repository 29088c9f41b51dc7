// src/local/mod.rs
//
// Event sources feeding the control loop. The acquisition backend is external;
// these adapt a TCP bridge, recorded files and a simulator to one polling trait.

pub mod client;
pub mod process_file;
pub mod server;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SourceError;

/// One classified spike from the acquisition backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpikeEvent {
    /// Acquisition clock ticks.
    pub timestamp: u64,
    pub unit_id: u32,
}

impl SpikeEvent {
    pub const FRAME_LEN: usize = 12;

    pub fn new(timestamp: u64, unit_id: u32) -> Self {
        Self { timestamp, unit_id }
    }

    /// Big-endian wire frame: 8 bytes timestamp, 4 bytes unit id.
    pub fn to_frame(&self) -> [u8; Self::FRAME_LEN] {
        let mut frame = [0u8; Self::FRAME_LEN];
        frame[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        frame[8..].copy_from_slice(&self.unit_id.to_be_bytes());
        frame
    }

    pub fn from_frame(frame: &[u8; Self::FRAME_LEN]) -> Self {
        let mut timestamp = [0u8; 8];
        let mut unit_id = [0u8; 4];
        timestamp.copy_from_slice(&frame[..8]);
        unit_id.copy_from_slice(&frame[8..]);
        Self {
            timestamp: u64::from_be_bytes(timestamp),
            unit_id: u32::from_be_bytes(unit_id),
        }
    }
}

/// Result of one poll of an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePoll {
    Event(SpikeEvent),
    /// Nothing arrived within the poll timeout.
    Timeout,
    /// The source is exhausted or the backend closed the stream.
    Ended,
}

pub trait EventSource: Send {
    /// Blocks for at most `timeout` waiting for the next spike.
    fn next_event(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError>;

    fn describe(&self) -> String;
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn next_event(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        (**self).next_event(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout_is_big_endian() {
        let event = SpikeEvent::new(0x0102_0304_0506_0708, 0x0A0B_0C0D);
        let frame = event.to_frame();
        assert_eq!(
            frame,
            [1, 2, 3, 4, 5, 6, 7, 8, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(SpikeEvent::from_frame(&frame), event);
    }
}

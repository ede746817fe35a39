//! Frame structure and serialization

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use crate::ProtocolError;

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No special flags
    pub const NONE: Self = Self(0);
    /// Last frame the sender will ever write in this direction
    pub const LAST: Self = Self(1);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.0 |= flag.0;
    }

    /// Clear a flag
    pub fn clear_flag(&mut self, flag: FrameFlags) {
        self.0 &= !flag.0;
    }
}

/// One length-prefixed unit on the wire, carrying exactly one encoded command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Per-direction sequence number, starting at zero
    pub sequence: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Encoded command envelope
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(sequence: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            sequence,
            flags,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(sequence: u32, payload: Bytes) -> Self {
        Self::new(sequence, FrameFlags::NONE, payload)
    }

    /// Create the final frame of a direction
    pub fn last(sequence: u32, payload: Bytes) -> Self {
        Self::new(sequence, FrameFlags::LAST, payload)
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Get the payload size
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Check if the sender promised not to write anything after this frame
    pub fn is_last(&self) -> bool {
        self.flags.has_flag(FrameFlags::LAST)
    }
}

/// Tracks the sequence numbers of one direction.
///
/// Used both when stamping outgoing frames and when verifying that incoming
/// frames arrive in write order.
#[derive(Debug, Default, Clone)]
pub struct Sequencer {
    next: u32,
}

impl Sequencer {
    /// Start at sequence zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number for an outgoing frame
    pub fn advance(&mut self) -> u32 {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        current
    }

    /// Check an incoming frame and move past it
    pub fn accept(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.sequence != self.next {
            return Err(ProtocolError::OutOfOrder {
                expected: self.next,
                actual: frame.sequence,
            });
        }
        self.next = self.next.wrapping_add(1);
        Ok(())
    }

    /// Skip a frame whose body could not be decoded
    pub fn skip(&mut self) {
        self.next = self.next.wrapping_add(1);
    }

    /// Sequence number expected next
    pub fn expected(&self) -> u32 {
        self.next
    }
}

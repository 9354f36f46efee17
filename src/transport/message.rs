//! Logical messages assembled from segments.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::Correlation;

use super::segment::Segment;

/// Discriminant of a logical message.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(u32);

impl MessageType {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.0)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a segment could not be added to a message under construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddMismatch {
    /// The segment declares another total size than the first one did.
    TotalSize { expected: u64, got: u64 },
    /// The segment does not continue where the previous one ended.
    Offset { expected: u64, got: u64 },
}

/// A logical message, complete once every payload byte has arrived.
#[derive(Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    message_type: MessageType,
    correlation: Correlation,
    payload: BytesMut,
    filled: usize,
}

impl CompleteMessage {
    /// A message whose payload is already whole.
    pub fn new(message_type: MessageType, correlation: Correlation, payload: Bytes) -> Self {
        let filled = payload.len();
        Self {
            message_type,
            correlation,
            payload: BytesMut::from(&payload[..]),
            filled,
        }
    }

    /// An empty message sized after the first segment seen for it.
    pub fn reserve(segment: &Segment) -> Self {
        let total = segment.total_size as usize;
        Self {
            message_type: segment.message_type,
            correlation: segment.correlation,
            payload: BytesMut::zeroed(total),
            filled: 0,
        }
    }

    /// Copy a segment's payload into place; returns whether the message is complete.
    pub fn add(&mut self, segment: &Segment) -> Result<bool, AddMismatch> {
        if segment.total_size != self.total_size() {
            return Err(AddMismatch::TotalSize {
                expected: self.total_size(),
                got: segment.total_size,
            });
        }
        if segment.offset != self.filled as u64 {
            return Err(AddMismatch::Offset {
                expected: self.filled as u64,
                got: segment.offset,
            });
        }
        let start = self.filled;
        let end = start + segment.payload.len();
        self.payload[start..end].copy_from_slice(&segment.payload);
        self.filled = end;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.payload.len()
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn correlation(&self) -> Correlation {
        self.correlation
    }

    pub fn total_size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload.freeze()
    }
}

impl fmt::Debug for CompleteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompleteMessage")
            .field("message_type", &self.message_type)
            .field("correlation", &self.correlation)
            .field("filled", &self.filled)
            .field("total_size", &self.payload.len())
            .finish()
    }
}

//! Segmented message transport.
//!
//! - segment: fixed-size frame codec (host or network byte order)
//! - message: logical messages and reassembly target
//! - cache: reassembly cache keyed by correlation
//! - device: inbound/outbound devices with blocking policies
//! - memory: local bounded queues (one machine, host byte order)
//! - stream: "CASL" framed byte streams between domains (network byte order)

use std::time::Instant;

use thiserror::Error;

use crate::core::{Correlation, QueueId};
use crate::error::{Effect, Transience};

pub mod cache;
pub mod device;
pub mod memory;
pub mod message;
pub mod segment;
pub mod stream;

pub use cache::{AddOutcome, CacheError, ReassemblyCache};
pub use device::{InboundDevice, Matcher, OutboundDevice, Policy};
pub use memory::{MemoryNamespace, MemoryReader, MemoryWriter};
pub use message::{CompleteMessage, MessageType};
pub use segment::{ByteOrder, HEADER_LEN, ProtocolError, Segment, SegmentCodec, split};
pub use stream::{FrameDecoder, StreamTransport};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("no queue {queue}")]
    UnknownQueue { queue: QueueId },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message {correlation} partially sent: {sent} of {total} segments")]
    PartialSend {
        correlation: Correlation,
        sent: usize,
        total: usize,
    },
}

impl TransportError {
    pub fn transience(&self) -> Transience {
        match self {
            TransportError::Disconnected | TransportError::UnknownQueue { .. } => {
                Transience::Permanent
            }
            TransportError::Protocol(_) | TransportError::Cache(_) => Transience::Permanent,
            TransportError::Io(_) => Transience::Retryable,
            TransportError::PartialSend { .. } => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            TransportError::PartialSend { .. } => Effect::Some,
            TransportError::Io(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }

    /// Errors recovered locally by dropping the offending segment.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Protocol(_) | TransportError::Cache(_))
    }
}

/// How long a single transport operation may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    NonBlocking,
    Blocking,
    Until(Instant),
}

/// Sending half of a transport.
pub trait TransportWriter {
    /// Write one segment. `Ok(false)` means the operation would have
    /// waited beyond what `mode` allows.
    fn write_segment(&mut self, segment: &Segment, mode: Mode) -> Result<bool, TransportError>;

    /// Largest payload of one segment.
    fn payload_max(&self) -> usize;

    /// Segments that can be written right now without waiting. `None` when
    /// the transport cannot tell.
    fn free_slots(&self) -> Option<usize> {
        None
    }
}

/// Receiving half of a transport.
///
/// Segments of one correlation are returned in the order they were written.
pub trait TransportReader {
    /// `Ok(None)` means no segment arrived within what `mode` allows.
    fn read_segment(&mut self, mode: Mode) -> Result<Option<Segment>, TransportError>;
}

/// Resolves a queue id to a writer.
pub trait Connector {
    fn connect(&self, queue: QueueId) -> Result<Box<dyn TransportWriter + Send>, TransportError>;
}

impl<W: TransportWriter + ?Sized> TransportWriter for Box<W> {
    fn write_segment(&mut self, segment: &Segment, mode: Mode) -> Result<bool, TransportError> {
        (**self).write_segment(segment, mode)
    }

    fn payload_max(&self) -> usize {
        (**self).payload_max()
    }

    fn free_slots(&self) -> Option<usize> {
        (**self).free_slots()
    }
}

impl<R: TransportReader + ?Sized> TransportReader for Box<R> {
    fn read_segment(&mut self, mode: Mode) -> Result<Option<Segment>, TransportError> {
        (**self).read_segment(mode)
    }
}

//! In-process bounded queues standing in for local IPC.
//!
//! Frames are encoded in host byte order exactly as they would be on a
//! machine-local queue, so the codec is exercised end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use crossbeam::channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};

use crate::core::QueueId;

use super::segment::{ByteOrder, ProtocolError, Segment, SegmentCodec};
use super::{Connector, Mode, TransportError, TransportReader, TransportWriter};

#[derive(Clone, Debug)]
pub struct MemoryWriter {
    sender: Sender<Bytes>,
    codec: SegmentCodec,
}

#[derive(Debug)]
pub struct MemoryReader {
    receiver: Receiver<Bytes>,
    codec: SegmentCodec,
}

/// Create a queue holding at most `capacity` frames of `frame_bytes` each.
pub fn queue(
    capacity: usize,
    frame_bytes: usize,
) -> Result<(MemoryWriter, MemoryReader), ProtocolError> {
    let codec = SegmentCodec::new(frame_bytes, ByteOrder::Host)?;
    let (sender, receiver) = bounded(capacity.max(1));
    Ok((
        MemoryWriter { sender, codec },
        MemoryReader { receiver, codec },
    ))
}

impl MemoryWriter {
    /// Frames currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

impl TransportWriter for MemoryWriter {
    fn write_segment(&mut self, segment: &Segment, mode: Mode) -> Result<bool, TransportError> {
        let frame = self.codec.encode(segment)?;
        match mode {
            Mode::NonBlocking => match self.sender.try_send(frame) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(_)) => Ok(false),
                Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
            },
            Mode::Blocking => self
                .sender
                .send(frame)
                .map(|()| true)
                .map_err(|_| TransportError::Disconnected),
            Mode::Until(deadline) => match self.sender.send_deadline(frame, deadline) {
                Ok(()) => Ok(true),
                Err(SendTimeoutError::Timeout(_)) => Ok(false),
                Err(SendTimeoutError::Disconnected(_)) => Err(TransportError::Disconnected),
            },
        }
    }

    fn payload_max(&self) -> usize {
        self.codec.payload_max()
    }

    fn free_slots(&self) -> Option<usize> {
        self.sender
            .capacity()
            .map(|capacity| capacity.saturating_sub(self.sender.len()))
    }
}

impl TransportReader for MemoryReader {
    fn read_segment(&mut self, mode: Mode) -> Result<Option<Segment>, TransportError> {
        let frame = match mode {
            Mode::NonBlocking => match self.receiver.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Disconnected),
            },
            Mode::Blocking => self
                .receiver
                .recv()
                .map_err(|_| TransportError::Disconnected)?,
            Mode::Until(deadline) => match self.receiver.recv_deadline(deadline) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            },
        };
        Ok(Some(self.codec.decode(frame)?))
    }
}

/// Registry of local queues reachable by id.
#[derive(Clone, Debug)]
pub struct MemoryNamespace {
    queues: Arc<RwLock<HashMap<QueueId, MemoryWriter>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
    frame_bytes: usize,
}

impl MemoryNamespace {
    pub fn new(capacity: usize, frame_bytes: usize) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
            frame_bytes,
        }
    }

    pub fn create(&self) -> Result<(QueueId, MemoryReader), ProtocolError> {
        let (writer, reader) = queue(self.capacity, self.frame_bytes)?;
        let id = QueueId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, writer);
        Ok((id, reader))
    }

    pub fn writer(&self, queue: QueueId) -> Result<MemoryWriter, TransportError> {
        self.queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&queue)
            .cloned()
            .ok_or(TransportError::UnknownQueue { queue })
    }

    /// Forget a queue; writers already handed out keep working until the
    /// reader is dropped.
    pub fn remove(&self, queue: QueueId) -> bool {
        self.queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&queue)
            .is_some()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}

impl Connector for MemoryNamespace {
    fn connect(&self, queue: QueueId) -> Result<Box<dyn TransportWriter + Send>, TransportError> {
        Ok(Box::new(self.writer(queue)?))
    }
}

//! Framed byte streams between domains.
//!
//! ```text
//! "CASL" | length u64 (big endian) | payload (length bytes)
//! ```
//!
//! The payload is one segment encoded in network byte order. While in
//! sync the length prefix is authoritative. After a framing error the
//! decoder scans forward for the next magic marker; a payload that happens
//! to contain the marker can mislead that scan, which is accepted.

use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::Limits;

use super::segment::{ByteOrder, ProtocolError, Segment, SegmentCodec};
use super::{Mode, TransportError, TransportReader, TransportWriter};

pub const MAGIC: [u8; 4] = *b"CASL";
pub const STREAM_HEADER_LEN: usize = MAGIC.len() + 8;

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Bytes, ProtocolError> {
    if payload.len() > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            max: max_frame_bytes,
            got: payload.len() as u64,
        });
    }
    let mut buf = BytesMut::with_capacity(STREAM_HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u64(payload.len() as u64);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder with magic-marker resynchronization.
///
/// Memory is bounded by one maximal frame plus whatever the last `feed`
/// added: bytes that cannot start a marker are dropped during a scan.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
    dropped_bytes: u64,
    resyncs: u64,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
            dropped_bytes: 0,
            resyncs: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if !self.buf.starts_with(&MAGIC) && !self.resync() {
                return None;
            }
            if self.buf.len() < STREAM_HEADER_LEN {
                return None;
            }

            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&self.buf[MAGIC.len()..STREAM_HEADER_LEN]);
            let length = u64::from_be_bytes(len_bytes);
            if length > self.max_frame_bytes as u64 {
                tracing::warn!(
                    length,
                    max = self.max_frame_bytes,
                    "stream frame length out of range; resynchronizing"
                );
                self.drop_front(1);
                continue;
            }

            let length = length as usize;
            if self.buf.len() < STREAM_HEADER_LEN + length {
                return None;
            }
            self.buf.advance(STREAM_HEADER_LEN);
            return Some(self.buf.split_to(length).freeze());
        }
    }

    /// Skip to the next marker. Returns false when more input is needed.
    fn resync(&mut self) -> bool {
        if let Some(pos) = find(&self.buf, &MAGIC) {
            self.resyncs += 1;
            tracing::warn!(skipped = pos, "stream lost sync; skipped to next marker");
            self.drop_front(pos);
            return true;
        }
        let keep = partial_marker_suffix(&self.buf);
        let drop = self.buf.len() - keep;
        if drop > 0 {
            tracing::debug!(dropped = drop, "dropped bytes that cannot start a marker");
            self.drop_front(drop);
        }
        false
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.advance(n);
        self.dropped_bytes += n as u64;
    }

    /// Bytes discarded while resynchronizing.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest buffer suffix that is a proper prefix of the marker.
fn partial_marker_suffix(buf: &[u8]) -> usize {
    (1..MAGIC.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == MAGIC[..n])
        .unwrap_or(0)
}

/// A segment transport over a byte stream.
///
/// Waiting is paced by the stream itself: non-blocking and timed modes are
/// honored when the stream is non-blocking or has a read timeout.
pub struct StreamTransport<S> {
    stream: S,
    codec: SegmentCodec,
    decoder: FrameDecoder,
    read_bytes: usize,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S, frame_bytes: usize, limits: &Limits) -> Result<Self, ProtocolError> {
        Ok(Self {
            stream,
            codec: SegmentCodec::new(frame_bytes, ByteOrder::Network)?,
            decoder: FrameDecoder::new(limits.max_stream_frame_bytes),
            read_bytes: limits.stream_read_bytes.max(1),
        })
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read> TransportReader for StreamTransport<S> {
    fn read_segment(&mut self, mode: Mode) -> Result<Option<Segment>, TransportError> {
        let mut chunk = vec![0u8; self.read_bytes];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(self.codec.decode(frame)?));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    match mode {
                        Mode::NonBlocking => return Ok(None),
                        Mode::Until(deadline) if Instant::now() >= deadline => return Ok(None),
                        Mode::Until(_) | Mode::Blocking => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl<S: Write> TransportWriter for StreamTransport<S> {
    fn write_segment(&mut self, segment: &Segment, _mode: Mode) -> Result<bool, TransportError> {
        let body = self.codec.encode(segment)?;
        let frame = encode_frame(&body, self.decoder.max_frame_bytes)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(true)
    }

    fn payload_max(&self) -> usize {
        self.codec.payload_max()
    }
}

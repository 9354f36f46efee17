//! Transport segment codec.
//!
//! Layout, all integers in the codec's byte order:
//!
//! ```text
//! type u32 | correlation [u8; 16] | offset u64 | total_size u64 | payload
//! ```
//!
//! The payload length is implied by the frame length.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::Correlation;

use super::message::MessageType;

pub const HEADER_LEN: usize = 4 + 16 + 8 + 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("frame of {frame_bytes} bytes leaves no room for payload after a {header_bytes} byte header")]
    FrameTooSmall {
        frame_bytes: usize,
        header_bytes: usize,
    },
    #[error("segment truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("segment payload too large: max {max} got {got}")]
    PayloadTooLarge { max: usize, got: usize },
    #[error("segment out of bounds: offset {offset} + {len} exceeds total size {total_size}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        total_size: u64,
    },
    #[error("stream frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: u64 },
}

/// Byte order of multi-byte header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// Local transports inside one machine.
    Host,
    /// Links crossing a domain boundary.
    Network,
}

impl ByteOrder {
    fn put_u32(self, buf: &mut BytesMut, value: u32) {
        match self {
            ByteOrder::Host => buf.put_slice(&value.to_ne_bytes()),
            ByteOrder::Network => buf.put_u32(value),
        }
    }

    fn put_u64(self, buf: &mut BytesMut, value: u64) {
        match self {
            ByteOrder::Host => buf.put_slice(&value.to_ne_bytes()),
            ByteOrder::Network => buf.put_u64(value),
        }
    }

    fn u32(self, raw: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Host => u32::from_ne_bytes(raw),
            ByteOrder::Network => u32::from_be_bytes(raw),
        }
    }

    fn u64(self, raw: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Host => u64::from_ne_bytes(raw),
            ByteOrder::Network => u64::from_be_bytes(raw),
        }
    }
}

/// One fixed-size piece of a logical message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub message_type: MessageType,
    pub correlation: Correlation,
    pub offset: u64,
    pub total_size: u64,
    pub payload: Bytes,
}

impl Segment {
    /// True when this segment ends its message.
    ///
    /// Only exact when segments of one correlation arrive in send order.
    pub fn is_last(&self) -> bool {
        self.offset.saturating_add(self.payload.len() as u64) == self.total_size
    }

    fn check_bounds(&self) -> Result<(), ProtocolError> {
        let end = self.offset.checked_add(self.payload.len() as u64);
        match end {
            Some(end) if end <= self.total_size => Ok(()),
            _ => Err(ProtocolError::OutOfBounds {
                offset: self.offset,
                len: self.payload.len(),
                total_size: self.total_size,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SegmentCodec {
    payload_max: usize,
    order: ByteOrder,
}

impl SegmentCodec {
    pub fn new(frame_bytes: usize, order: ByteOrder) -> Result<Self, ProtocolError> {
        let payload_max = frame_bytes.saturating_sub(HEADER_LEN);
        if payload_max == 0 {
            return Err(ProtocolError::FrameTooSmall {
                frame_bytes,
                header_bytes: HEADER_LEN,
            });
        }
        Ok(Self { payload_max, order })
    }

    pub fn payload_max(&self) -> usize {
        self.payload_max
    }

    pub fn frame_bytes(&self) -> usize {
        self.payload_max + HEADER_LEN
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn encode(&self, segment: &Segment) -> Result<Bytes, ProtocolError> {
        if segment.payload.len() > self.payload_max {
            return Err(ProtocolError::PayloadTooLarge {
                max: self.payload_max,
                got: segment.payload.len(),
            });
        }
        segment.check_bounds()?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + segment.payload.len());
        self.order.put_u32(&mut buf, segment.message_type.get());
        buf.put_slice(segment.correlation.as_bytes());
        self.order.put_u64(&mut buf, segment.offset);
        self.order.put_u64(&mut buf, segment.total_size);
        buf.put_slice(&segment.payload);
        Ok(buf.freeze())
    }

    pub fn decode(&self, mut frame: Bytes) -> Result<Segment, ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                need: HEADER_LEN,
                got: frame.len(),
            });
        }
        let header = frame.split_to(HEADER_LEN);
        let payload = frame;
        if payload.len() > self.payload_max {
            return Err(ProtocolError::PayloadTooLarge {
                max: self.payload_max,
                got: payload.len(),
            });
        }

        let message_type = MessageType::new(self.order.u32(array(&header[0..4])));
        let correlation = Correlation::from_bytes(array(&header[4..20]));
        let offset = self.order.u64(array(&header[20..28]));
        let total_size = self.order.u64(array(&header[28..36]));

        let segment = Segment {
            message_type,
            correlation,
            offset,
            total_size,
            payload,
        };
        segment.check_bounds()?;
        Ok(segment)
    }
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

/// Split a logical message into segments of at most `payload_max` bytes.
///
/// An empty payload still produces one segment so the receiver learns the
/// message exists.
pub fn split(
    message_type: MessageType,
    correlation: Correlation,
    payload: Bytes,
    payload_max: usize,
) -> Vec<Segment> {
    let total_size = payload.len() as u64;
    if payload.is_empty() || payload_max == 0 {
        return vec![Segment {
            message_type,
            correlation,
            offset: 0,
            total_size,
            payload,
        }];
    }

    let mut segments = Vec::with_capacity(payload.len().div_ceil(payload_max));
    let mut offset = 0usize;
    while offset < payload.len() {
        let end = (offset + payload_max).min(payload.len());
        segments.push(Segment {
            message_type,
            correlation,
            offset: offset as u64,
            total_size,
            payload: payload.slice(offset..end),
        });
        offset = end;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn segment(payload: &'static [u8], offset: u64, total_size: u64) -> Segment {
        Segment {
            message_type: MessageType::new(7),
            correlation: Correlation::new(),
            offset,
            total_size,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn codec_rejects_frame_without_payload_room() {
        let err = SegmentCodec::new(HEADER_LEN, ByteOrder::Host).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooSmall { .. }));
        assert_eq!(
            SegmentCodec::new(HEADER_LEN + 1, ByteOrder::Host)
                .unwrap()
                .payload_max(),
            1
        );
    }

    #[test]
    fn network_order_is_big_endian() {
        let codec = SegmentCodec::new(64, ByteOrder::Network).unwrap();
        let seg = segment(b"abc", 2, 5);
        let frame = codec.encode(&seg).unwrap();
        assert_eq!(&frame[0..4], &[0, 0, 0, 7]);
        assert_eq!(&frame[20..28], &2u64.to_be_bytes());
        assert_eq!(&frame[28..36], &5u64.to_be_bytes());
        assert_eq!(codec.decode(frame).unwrap(), seg);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let codec = SegmentCodec::new(64, ByteOrder::Host).unwrap();
        let err = codec.decode(Bytes::from_static(&[0u8; 10])).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { need: 36, got: 10 });
    }

    #[test]
    fn decode_rejects_out_of_bounds_offset() {
        let codec = SegmentCodec::new(64, ByteOrder::Host).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&7u32.to_ne_bytes());
        buf.put_slice(&[1u8; 16]);
        buf.put_slice(&4u64.to_ne_bytes());
        buf.put_slice(&5u64.to_ne_bytes());
        buf.put_slice(b"xy");
        let err = codec.decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfBounds { .. }));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let codec = SegmentCodec::new(HEADER_LEN + 2, ByteOrder::Host).unwrap();
        let err = codec.encode(&segment(b"abc", 0, 3)).unwrap_err();
        assert_eq!(err, ProtocolError::PayloadTooLarge { max: 2, got: 3 });
    }

    #[test]
    fn split_empty_payload_is_one_segment() {
        let parts = split(MessageType::new(1), Correlation::new(), Bytes::new(), 8);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_last());
        assert_eq!(parts[0].total_size, 0);
    }

    #[test]
    fn split_exact_payload_max_is_one_segment() {
        let payload = Bytes::from(vec![9u8; 8]);
        let parts = split(MessageType::new(1), Correlation::new(), payload, 8);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_last());
    }

    proptest! {
        #[test]
        fn split_covers_payload_in_order(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            payload_max in 1usize..64,
        ) {
            let correlation = Correlation::new();
            let bytes = Bytes::from(payload.clone());
            let parts = split(MessageType::new(3), correlation, bytes, payload_max);

            let mut joined = Vec::new();
            for (idx, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.offset as usize, joined.len());
                prop_assert!(part.payload.len() <= payload_max);
                prop_assert_eq!(part.correlation, correlation);
                prop_assert_eq!(part.is_last(), idx + 1 == parts.len());
                joined.extend_from_slice(&part.payload);
            }
            prop_assert_eq!(joined, payload);
        }
    }
}

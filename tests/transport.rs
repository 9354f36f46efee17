//! Devices over the local queue and gateway stream transports.

use std::io::Cursor;

use bytes::Bytes;

use tmbus::core::Correlation;
use tmbus::transport::{
    HEADER_LEN, InboundDevice, Matcher, MemoryNamespace, MessageType, Mode, OutboundDevice,
    Policy, StreamTransport, TransportError, TransportWriter, split,
};
use tmbus::Limits;

const FRAME_BYTES: usize = 128;
const PAYLOAD_MAX: usize = FRAME_BYTES - HEADER_LEN;
const KIND: MessageType = MessageType::new(77);

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

#[test]
fn local_queue_delivers_empty_exact_and_multi_segment_messages() {
    let namespace = MemoryNamespace::new(64, FRAME_BYTES);
    let (queue, reader) = namespace.create().unwrap();
    let mut inbound = InboundDevice::new(reader, &Limits::default());
    let mut outbound = OutboundDevice::new(namespace.writer(queue).unwrap());
    assert_eq!(outbound.payload_max(), PAYLOAD_MAX);

    for len in [0, PAYLOAD_MAX, 3 * PAYLOAD_MAX + 7] {
        let correlation = Correlation::new();
        let sent = outbound
            .put(KIND, correlation, payload(len), Policy::Blocking)
            .unwrap();
        assert_eq!(sent, Some(correlation));

        let message = inbound
            .receive(&Matcher::Correlation(correlation), Policy::NonBlocking)
            .unwrap()
            .expect("complete message");
        assert_eq!(message.message_type(), KIND);
        assert_eq!(message.payload(), &payload(len)[..]);
        assert!(inbound.cache().is_empty());
    }
}

#[test]
fn receive_matches_by_type_and_keeps_the_rest() {
    let namespace = MemoryNamespace::new(64, FRAME_BYTES);
    let (queue, reader) = namespace.create().unwrap();
    let mut inbound = InboundDevice::new(reader, &Limits::default());
    let mut outbound = OutboundDevice::new(namespace.writer(queue).unwrap());
    let other = MessageType::new(78);

    let first = Correlation::new();
    outbound
        .put(other, first, payload(10), Policy::Blocking)
        .unwrap();
    let second = Correlation::new();
    outbound
        .put(KIND, second, payload(300), Policy::Blocking)
        .unwrap();

    let got = inbound.next_type(KIND, Policy::NonBlocking).unwrap().unwrap();
    assert_eq!(got.correlation(), second);
    assert_eq!(inbound.cache().len(), 1);
    let got = inbound.next(Policy::NonBlocking).unwrap().unwrap();
    assert_eq!(got.correlation(), first);
    assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
}

#[test]
fn stream_resyncs_after_garbage_without_losing_later_frames() {
    let limits = Limits::default();
    let writer = StreamTransport::new(Vec::new(), FRAME_BYTES, &limits).unwrap();
    let mut outbound = OutboundDevice::new(writer);

    let first = Correlation::new();
    outbound
        .put(KIND, first, payload(3 * PAYLOAD_MAX + 7), Policy::Blocking)
        .unwrap();
    let boundary = outbound.writer_mut().get_ref().len();
    let second = Correlation::new();
    outbound
        .put(KIND, second, payload(40), Policy::Blocking)
        .unwrap();

    let sent = outbound.writer_mut().get_ref();
    let garbage = b"\x00\x01junk-CAS";
    let mut wire = sent[..boundary].to_vec();
    wire.extend_from_slice(garbage);
    wire.extend_from_slice(&sent[boundary..]);

    let reader = StreamTransport::new(Cursor::new(wire), FRAME_BYTES, &limits).unwrap();
    let mut inbound = InboundDevice::new(reader, &limits);
    let got = inbound
        .next_correlation(first, Policy::Blocking)
        .unwrap()
        .unwrap();
    assert_eq!(got.payload(), &payload(3 * PAYLOAD_MAX + 7)[..]);
    let got = inbound
        .next_correlation(second, Policy::Blocking)
        .unwrap()
        .unwrap();
    assert_eq!(got.payload(), &payload(40)[..]);

    let decoder = inbound.reader_mut().decoder();
    assert_eq!(decoder.dropped_bytes(), garbage.len() as u64);
    assert!(matches!(
        inbound.next(Policy::Blocking),
        Err(TransportError::Disconnected)
    ));
}

#[test]
fn discard_is_idempotent_and_drops_late_segments() {
    let namespace = MemoryNamespace::new(64, FRAME_BYTES);
    let (queue, reader) = namespace.create().unwrap();
    let mut inbound = InboundDevice::new(reader, &Limits::default());
    let mut writer = namespace.writer(queue).unwrap();

    let never_seen = Correlation::new();
    inbound.discard(never_seen);
    inbound.discard(never_seen);
    assert!(inbound.cache().is_discarded(&never_seen));
    assert_eq!(inbound.cache().discarded_len(), 1);

    let cancelled = Correlation::new();
    let segments = split(KIND, cancelled, payload(3 * PAYLOAD_MAX), PAYLOAD_MAX);
    assert_eq!(segments.len(), 3);
    writer.write_segment(&segments[0], Mode::Blocking).unwrap();
    assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
    assert_eq!(inbound.cache().len(), 1);

    inbound.discard(cancelled);
    inbound.discard(cancelled);
    assert!(inbound.cache().is_empty());
    assert_eq!(inbound.cache().discarded_len(), 2);
    for segment in &segments[1..] {
        writer.write_segment(segment, Mode::Blocking).unwrap();
    }
    for segment in split(KIND, never_seen, payload(5), PAYLOAD_MAX) {
        writer.write_segment(&segment, Mode::Blocking).unwrap();
    }
    let kept = Correlation::new();
    for segment in split(KIND, kept, payload(5), PAYLOAD_MAX) {
        writer.write_segment(&segment, Mode::Blocking).unwrap();
    }

    let got = inbound.next(Policy::NonBlocking).unwrap().unwrap();
    assert_eq!(got.correlation(), kept);
    assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
    assert!(inbound.cache().is_empty());
    // Terminal segments passed, so neither correlation is remembered.
    assert_eq!(inbound.cache().discarded_len(), 0);
}

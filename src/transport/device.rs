//! Inbound and outbound message devices.
//!
//! The outbound device splits a logical message into segments and writes
//! them; the inbound device pumps segments into a reassembly cache until a
//! message matching the caller's interest is complete.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::{Correlation, Limits};

use super::cache::ReassemblyCache;
use super::message::{CompleteMessage, MessageType};
use super::segment::split;
use super::{Mode, TransportError, TransportReader, TransportWriter};

/// How long a device call may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    NonBlocking,
    Blocking,
    Timeout(Duration),
}

impl Policy {
    fn mode(self, now: Instant) -> Mode {
        match self {
            Policy::NonBlocking => Mode::NonBlocking,
            Policy::Blocking => Mode::Blocking,
            Policy::Timeout(timeout) => Mode::Until(now + timeout),
        }
    }
}

/// Which complete message a receive is waiting for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Matcher {
    Any,
    Type(MessageType),
    Types(Vec<MessageType>),
    Correlation(Correlation),
}

impl Matcher {
    pub fn matches(&self, message: &CompleteMessage) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Type(t) => message.message_type() == *t,
            Matcher::Types(types) => types.contains(&message.message_type()),
            Matcher::Correlation(c) => message.correlation() == *c,
        }
    }
}

pub struct InboundDevice<R> {
    reader: R,
    cache: ReassemblyCache,
}

impl<R: TransportReader> InboundDevice<R> {
    pub fn new(reader: R, limits: &Limits) -> Self {
        Self {
            reader,
            cache: ReassemblyCache::new(limits),
        }
    }

    /// Receive a matching message; every transport error propagates.
    pub fn receive(
        &mut self,
        matcher: &Matcher,
        policy: Policy,
    ) -> Result<Option<CompleteMessage>, TransportError> {
        self.receive_with(matcher, policy, Err)
    }

    /// Receive a matching message, passing errors to `handler`.
    ///
    /// The handler returns `Ok(())` to keep receiving or an error to abort.
    /// When the handler swallows an error from the transport itself (rather
    /// than a malformed or unbufferable segment) the receive ends empty.
    pub fn receive_with<H>(
        &mut self,
        matcher: &Matcher,
        policy: Policy,
        mut handler: H,
    ) -> Result<Option<CompleteMessage>, TransportError>
    where
        H: FnMut(TransportError) -> Result<(), TransportError>,
    {
        let mode = policy.mode(Instant::now());
        loop {
            if let Some(message) = self.cache.take_matching(|m| matcher.matches(m)) {
                return Ok(Some(message));
            }
            match self.reader.read_segment(mode) {
                Ok(Some(segment)) => {
                    if let Err(err) = self.cache.add_segment(segment) {
                        handler(err.into())?;
                    }
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    let recoverable = err.is_recoverable();
                    handler(err)?;
                    if !recoverable {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub fn next(&mut self, policy: Policy) -> Result<Option<CompleteMessage>, TransportError> {
        self.receive(&Matcher::Any, policy)
    }

    pub fn next_type(
        &mut self,
        message_type: MessageType,
        policy: Policy,
    ) -> Result<Option<CompleteMessage>, TransportError> {
        self.receive(&Matcher::Type(message_type), policy)
    }

    pub fn next_correlation(
        &mut self,
        correlation: Correlation,
        policy: Policy,
    ) -> Result<Option<CompleteMessage>, TransportError> {
        self.receive(&Matcher::Correlation(correlation), policy)
    }

    pub fn discard(&mut self, correlation: Correlation) {
        self.cache.discard(correlation);
    }

    /// Put a complete message back so a later receive can match it.
    pub fn push(&mut self, message: CompleteMessage) {
        self.cache.push(message);
    }

    /// Move every segment already queued into the cache.
    pub fn flush(&mut self) -> Result<usize, TransportError> {
        let mut moved = 0;
        while let Some(segment) = self.reader.read_segment(Mode::NonBlocking)? {
            moved += 1;
            if let Err(err) = self.cache.add_segment(segment) {
                tracing::warn!(error = %err, "dropped segment while flushing");
            }
        }
        Ok(moved)
    }

    /// Drop everything queued and cached.
    pub fn clear(&mut self) -> Result<(), TransportError> {
        while self.reader.read_segment(Mode::NonBlocking)?.is_some() {}
        self.cache.clear();
        Ok(())
    }

    pub fn cache(&self) -> &ReassemblyCache {
        &self.cache
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

pub struct OutboundDevice<W> {
    writer: W,
}

impl<W: TransportWriter> OutboundDevice<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send a logical message under `correlation`.
    ///
    /// Returns `Ok(None)` when the message could not be queued within the
    /// policy; nothing was sent in that case. A non-blocking send checks
    /// that the whole message fits before writing its first segment, so it
    /// never waits and never leaves a message half queued because the target
    /// was full. A failure after the first segment is
    /// `TransportError::PartialSend` and the correlation must not be reused.
    pub fn put(
        &mut self,
        message_type: MessageType,
        correlation: Correlation,
        payload: Bytes,
        policy: Policy,
    ) -> Result<Option<Correlation>, TransportError> {
        let segments = split(
            message_type,
            correlation,
            payload,
            self.writer.payload_max(),
        );
        let total = segments.len();
        let mode = policy.mode(Instant::now());
        if mode == Mode::NonBlocking
            && self.writer.free_slots().is_some_and(|free| free < total)
        {
            tracing::trace!(%correlation, segments = total, "target full; send would block");
            return Ok(None);
        }

        for (sent, segment) in segments.iter().enumerate() {
            match (sent, self.writer.write_segment(segment, mode)) {
                (_, Ok(true)) => {}
                (0, Ok(false)) => return Ok(None),
                (0, Err(err)) => return Err(err),
                (sent, Ok(false)) => {
                    tracing::warn!(%correlation, sent, total, "target filled up mid-message");
                    return Err(TransportError::PartialSend {
                        correlation,
                        sent,
                        total,
                    });
                }
                (sent, Err(err)) => {
                    tracing::warn!(%correlation, sent, total, error = %err, "send failed mid-message");
                    return Err(TransportError::PartialSend {
                        correlation,
                        sent,
                        total,
                    });
                }
            }
        }
        tracing::trace!(%correlation, %message_type, segments = total, "message sent");
        Ok(Some(correlation))
    }

    pub fn put_message(
        &mut self,
        message: CompleteMessage,
        policy: Policy,
    ) -> Result<Option<Correlation>, TransportError> {
        let message_type = message.message_type();
        let correlation = message.correlation();
        self.put(message_type, correlation, message.into_payload(), policy)
    }

    pub fn payload_max(&self) -> usize {
        self.writer.payload_max()
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use crate::transport::segment::HEADER_LEN;

    fn pair(capacity: usize, payload_max: usize) -> (OutboundDevice<memory::MemoryWriter>, InboundDevice<memory::MemoryReader>) {
        let (writer, reader) = memory::queue(capacity, HEADER_LEN + payload_max).unwrap();
        (
            OutboundDevice::new(writer),
            InboundDevice::new(reader, &Limits::default()),
        )
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn roundtrip_at_interesting_sizes() {
        let payload_max = 16;
        for len in [0, 1, payload_max, payload_max + 1, 3 * payload_max + 7] {
            let (mut out, mut inbound) = pair(64, payload_max);
            let correlation = Correlation::new();
            let sent = out
                .put(MessageType::new(9), correlation, payload(len), Policy::Blocking)
                .unwrap();
            assert_eq!(sent, Some(correlation));
            let msg = inbound.next(Policy::NonBlocking).unwrap().unwrap();
            assert_eq!(msg.correlation(), correlation);
            assert_eq!(msg.message_type(), MessageType::new(9));
            assert_eq!(msg.payload(), &payload(len)[..], "len {len}");
        }
    }

    #[test]
    fn non_blocking_receive_on_empty_queue_is_empty() {
        let (_out, mut inbound) = pair(4, 16);
        assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
    }

    #[test]
    fn timeout_receive_gives_up() {
        let (_out, mut inbound) = pair(4, 16);
        let got = inbound
            .next(Policy::Timeout(Duration::from_millis(5)))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn non_blocking_send_on_full_queue_would_block() {
        let (mut out, _inbound) = pair(1, 16);
        out.put(MessageType::new(1), Correlation::new(), payload(4), Policy::NonBlocking)
            .unwrap()
            .unwrap();
        let second = out
            .put(MessageType::new(1), Correlation::new(), payload(4), Policy::NonBlocking)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn non_blocking_send_larger_than_free_room_sends_nothing() {
        let (mut out, mut inbound) = pair(2, 4);
        let correlation = Correlation::new();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let sender = std::thread::spawn(move || {
            let sent = out.put(MessageType::new(1), correlation, payload(12), Policy::NonBlocking);
            done_tx.send(()).unwrap();
            (out, sent)
        });
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("non-blocking send returned");
        let (mut out, sent) = sender.join().unwrap();
        assert!(sent.unwrap().is_none());
        assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
        assert_eq!(out.writer_mut().queued(), 0);

        let small = out
            .put(MessageType::new(1), Correlation::new(), payload(8), Policy::NonBlocking)
            .unwrap();
        assert!(small.is_some());
        assert_eq!(out.writer_mut().queued(), 2);
    }

    #[test]
    fn timed_send_failing_mid_message_is_partial() {
        let (mut out, _inbound) = pair(2, 4);
        let err = out
            .put(
                MessageType::new(1),
                Correlation::new(),
                payload(12),
                Policy::Timeout(Duration::from_millis(5)),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::PartialSend { sent: 2, total: 3, .. }));
    }

    #[test]
    fn receive_by_correlation_leaves_others_cached() {
        let (mut out, mut inbound) = pair(16, 8);
        let first = Correlation::new();
        let second = Correlation::new();
        out.put(MessageType::new(1), first, payload(20), Policy::Blocking)
            .unwrap();
        out.put(MessageType::new(2), second, payload(3), Policy::Blocking)
            .unwrap();

        let got = inbound
            .next_correlation(second, Policy::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(got.correlation(), second);
        assert_eq!(inbound.cache().len(), 1);
        let got = inbound
            .next_type(MessageType::new(1), Policy::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(got.correlation(), first);
    }

    #[test]
    fn discarded_reply_is_never_delivered() {
        let (mut out, mut inbound) = pair(16, 8);
        let correlation = Correlation::new();
        inbound.discard(correlation);
        out.put(MessageType::new(1), correlation, payload(20), Policy::Blocking)
            .unwrap();
        assert!(inbound.next(Policy::NonBlocking).unwrap().is_none());
        assert!(inbound.cache().is_empty());
    }

    #[test]
    fn receive_with_handler_skips_unbufferable_message() {
        let (writer, reader) = memory::queue(16, HEADER_LEN + 8).unwrap();
        let mut out = OutboundDevice::new(writer);
        let limits = Limits {
            max_cache_bytes: 16,
            ..Limits::default()
        };
        let mut inbound = InboundDevice::new(reader, &limits);
        out.put(MessageType::new(1), Correlation::new(), payload(40), Policy::Blocking)
            .unwrap();
        let small = Correlation::new();
        out.put(MessageType::new(1), small, payload(4), Policy::Blocking)
            .unwrap();

        let mut errors = 0;
        let got = inbound
            .receive_with(&Matcher::Any, Policy::NonBlocking, |err| {
                assert!(err.is_recoverable());
                errors += 1;
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(got.correlation(), small);
        assert_eq!(errors, 1);
    }

    #[test]
    fn receive_propagates_cache_errors_without_handler() {
        let (writer, reader) = memory::queue(16, HEADER_LEN + 8).unwrap();
        let mut out = OutboundDevice::new(writer);
        let limits = Limits {
            max_cache_bytes: 16,
            ..Limits::default()
        };
        let mut inbound = InboundDevice::new(reader, &limits);
        out.put(MessageType::new(1), Correlation::new(), payload(40), Policy::Blocking)
            .unwrap();
        let err = inbound.next(Policy::NonBlocking).unwrap_err();
        assert!(matches!(err, TransportError::Cache(_)));
    }

    #[test]
    fn flush_then_clear_empties_everything() {
        let (mut out, mut inbound) = pair(16, 8);
        out.put(MessageType::new(1), Correlation::new(), payload(20), Policy::Blocking)
            .unwrap();
        assert_eq!(inbound.flush().unwrap(), 3);
        assert_eq!(inbound.cache().len(), 1);
        inbound.clear().unwrap();
        assert!(inbound.cache().is_empty());
    }
}

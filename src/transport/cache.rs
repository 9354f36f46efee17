//! Reassembly of logical messages from transport segments.
//!
//! Segments of one correlation must arrive in send order. Every
//! `TransportReader` guarantees that, and the terminal-segment check used
//! for discarded correlations relies on it.

use std::collections::VecDeque;

use thiserror::Error;

use crate::core::{Correlation, Limits};

use super::message::{AddMismatch, CompleteMessage};
use super::segment::Segment;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    #[error("message {correlation} of {total_size} bytes exceeds cache bound of {max_bytes} bytes")]
    MessageTooLarge {
        correlation: Correlation,
        total_size: u64,
        max_bytes: usize,
    },
    #[error("cache full of complete messages ({messages} messages, {bytes} bytes); dropped {correlation}")]
    Full {
        correlation: Correlation,
        messages: usize,
        bytes: usize,
    },
    #[error("segment does not continue message {correlation}: {mismatch:?}")]
    Inconsistent {
        correlation: Correlation,
        mismatch: AddMismatch,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The correlation was discarded; the segment was dropped.
    Discarded,
    /// The segment was stored, the message is still incomplete.
    Buffered,
    /// The segment completed its message.
    Completed,
}

#[derive(Debug)]
pub struct ReassemblyCache {
    messages: VecDeque<CompleteMessage>,
    discarded: VecDeque<Correlation>,
    reserved_bytes: usize,
    max_bytes: usize,
    max_messages: usize,
    max_discarded: usize,
}

impl ReassemblyCache {
    pub fn new(limits: &Limits) -> Self {
        Self {
            messages: VecDeque::new(),
            discarded: VecDeque::new(),
            reserved_bytes: 0,
            max_bytes: limits.max_cache_bytes,
            max_messages: limits.max_cache_messages.max(1),
            max_discarded: limits.max_discarded.max(1),
        }
    }

    pub fn add_segment(&mut self, segment: Segment) -> Result<AddOutcome, CacheError> {
        let correlation = segment.correlation;
        if self.is_discarded(&correlation) {
            if segment.is_last() {
                self.discarded.retain(|c| *c != correlation);
            }
            tracing::trace!(%correlation, offset = segment.offset, "dropped segment of discarded message");
            return Ok(AddOutcome::Discarded);
        }

        if let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.correlation() == correlation && !m.is_complete())
        {
            return match self.messages[idx].add(&segment) {
                Ok(true) => Ok(AddOutcome::Completed),
                Ok(false) => Ok(AddOutcome::Buffered),
                Err(mismatch) => {
                    self.remove_at(idx);
                    if !segment.is_last() {
                        self.mark_discarded(correlation);
                    }
                    Err(CacheError::Inconsistent {
                        correlation,
                        mismatch,
                    })
                }
            };
        }

        let total_size = segment.total_size;
        if total_size > self.max_bytes as u64 {
            if !segment.is_last() {
                self.mark_discarded(correlation);
            }
            return Err(CacheError::MessageTooLarge {
                correlation,
                total_size,
                max_bytes: self.max_bytes,
            });
        }
        let total_size = total_size as usize;

        if !self.make_room(total_size) {
            if !segment.is_last() {
                self.mark_discarded(correlation);
            }
            return Err(CacheError::Full {
                correlation,
                messages: self.messages.len(),
                bytes: self.reserved_bytes,
            });
        }

        let mut message = CompleteMessage::reserve(&segment);
        let complete = match message.add(&segment) {
            Ok(complete) => complete,
            Err(mismatch) => {
                if !segment.is_last() {
                    self.mark_discarded(correlation);
                }
                return Err(CacheError::Inconsistent {
                    correlation,
                    mismatch,
                });
            }
        };
        self.reserved_bytes += total_size;
        self.messages.push_back(message);
        Ok(if complete {
            AddOutcome::Completed
        } else {
            AddOutcome::Buffered
        })
    }

    /// Evict the oldest incomplete messages until `incoming` bytes fit.
    fn make_room(&mut self, incoming: usize) -> bool {
        while self.reserved_bytes + incoming > self.max_bytes
            || self.messages.len() >= self.max_messages
        {
            let Some(idx) = self.messages.iter().position(|m| !m.is_complete()) else {
                return false;
            };
            let Some(evicted) = self.remove_at(idx) else {
                return false;
            };
            tracing::warn!(
                correlation = %evicted.correlation(),
                total_size = evicted.total_size(),
                "evicted incomplete message from reassembly cache"
            );
            self.mark_discarded(evicted.correlation());
        }
        true
    }

    /// Remove and return the first complete message accepted by `predicate`.
    pub fn take_matching(
        &mut self,
        mut predicate: impl FnMut(&CompleteMessage) -> bool,
    ) -> Option<CompleteMessage> {
        let idx = self
            .messages
            .iter()
            .position(|m| m.is_complete() && predicate(m))?;
        self.remove_at(idx)
    }

    /// Store a complete message, e.g. one a reader took but could not handle yet.
    pub fn push(&mut self, message: CompleteMessage) {
        self.reserved_bytes += message.total_size() as usize;
        self.messages.push_back(message);
    }

    /// Stop caching a correlation.
    ///
    /// An incomplete message is dropped. A complete one stays available to
    /// whoever polls for it. In every case later segments for the
    /// correlation are dropped until its terminal segment passes.
    pub fn discard(&mut self, correlation: Correlation) {
        if let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.correlation() == correlation && !m.is_complete())
        {
            self.remove_at(idx);
        }
        self.mark_discarded(correlation);
    }

    pub fn is_discarded(&self, correlation: &Correlation) -> bool {
        self.discarded.contains(correlation)
    }

    /// Number of cached messages, complete or not.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    pub fn discarded_len(&self) -> usize {
        self.discarded.len()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.discarded.clear();
        self.reserved_bytes = 0;
    }

    fn mark_discarded(&mut self, correlation: Correlation) {
        if self.discarded.contains(&correlation) {
            return;
        }
        if self.discarded.len() >= self.max_discarded {
            self.discarded.pop_front();
        }
        self.discarded.push_back(correlation);
    }

    fn remove_at(&mut self, idx: usize) -> Option<CompleteMessage> {
        let message = self.messages.remove(idx)?;
        self.reserved_bytes = self
            .reserved_bytes
            .saturating_sub(message.total_size() as usize);
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::MessageType;
    use crate::transport::segment::split;
    use bytes::Bytes;

    fn limits() -> Limits {
        Limits {
            max_cache_bytes: 64,
            max_cache_messages: 4,
            max_discarded: 3,
            ..Limits::default()
        }
    }

    fn segments(correlation: Correlation, len: usize, payload_max: usize) -> Vec<Segment> {
        let payload = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>());
        split(MessageType::new(5), correlation, payload, payload_max)
    }

    #[test]
    fn reassembles_multi_segment_message() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        let parts = segments(c, 10, 4);
        assert_eq!(cache.add_segment(parts[0].clone()), Ok(AddOutcome::Buffered));
        assert_eq!(cache.add_segment(parts[1].clone()), Ok(AddOutcome::Buffered));
        assert!(cache.take_matching(|_| true).is_none());
        assert_eq!(cache.add_segment(parts[2].clone()), Ok(AddOutcome::Completed));
        let msg = cache.take_matching(|m| m.correlation() == c).unwrap();
        assert_eq!(msg.payload(), (0..10u8).collect::<Vec<_>>().as_slice());
        assert!(cache.is_empty());
        assert_eq!(cache.reserved_bytes(), 0);
    }

    #[test]
    fn discard_before_arrival_drops_whole_message() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        cache.discard(c);
        cache.discard(c);
        assert_eq!(cache.discarded_len(), 1);
        for part in segments(c, 10, 4) {
            assert_eq!(cache.add_segment(part), Ok(AddOutcome::Discarded));
        }
        assert!(cache.is_empty());
        assert!(!cache.is_discarded(&c));
    }

    #[test]
    fn discard_in_flight_drops_rest() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        let parts = segments(c, 10, 4);
        cache.add_segment(parts[0].clone()).unwrap();
        cache.discard(c);
        assert!(cache.is_empty());
        assert_eq!(cache.add_segment(parts[1].clone()), Ok(AddOutcome::Discarded));
        assert_eq!(cache.add_segment(parts[2].clone()), Ok(AddOutcome::Discarded));
        assert!(!cache.is_discarded(&c));
    }

    #[test]
    fn discard_of_complete_message_keeps_it_readable() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        for part in segments(c, 3, 4) {
            cache.add_segment(part).unwrap();
        }
        cache.discard(c);
        assert!(cache.take_matching(|m| m.correlation() == c).is_some());
    }

    #[test]
    fn overflow_evicts_oldest_incomplete() {
        let mut cache = ReassemblyCache::new(&limits());
        let old = Correlation::new();
        let old_parts = segments(old, 40, 8);
        cache.add_segment(old_parts[0].clone()).unwrap();

        let new = Correlation::new();
        let new_parts = segments(new, 40, 8);
        assert_eq!(
            cache.add_segment(new_parts[0].clone()),
            Ok(AddOutcome::Buffered)
        );
        assert_eq!(cache.len(), 1);
        assert!(cache.is_discarded(&old));
        assert_eq!(
            cache.add_segment(old_parts[1].clone()),
            Ok(AddOutcome::Discarded)
        );
    }

    #[test]
    fn oversized_message_is_rejected_and_discarded() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        let parts = segments(c, 100, 16);
        let err = cache.add_segment(parts[0].clone()).unwrap_err();
        assert!(matches!(err, CacheError::MessageTooLarge { .. }));
        assert!(cache.is_discarded(&c));
        assert_eq!(cache.add_segment(parts[1].clone()), Ok(AddOutcome::Discarded));
    }

    #[test]
    fn full_of_complete_messages_rejects_new_one() {
        let mut cache = ReassemblyCache::new(&limits());
        for _ in 0..4 {
            for part in segments(Correlation::new(), 2, 4) {
                cache.add_segment(part).unwrap();
            }
        }
        let err = cache
            .add_segment(segments(Correlation::new(), 2, 4).remove(0))
            .unwrap_err();
        assert!(matches!(err, CacheError::Full { .. }));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn discard_set_is_capped() {
        let mut cache = ReassemblyCache::new(&limits());
        let ids: Vec<_> = (0..5).map(|_| Correlation::new()).collect();
        for id in &ids {
            cache.discard(*id);
        }
        assert_eq!(cache.discarded_len(), 3);
        assert!(!cache.is_discarded(&ids[0]));
        assert!(cache.is_discarded(&ids[4]));
    }

    proptest::proptest! {
        #[test]
        fn interleaved_messages_reassemble_independently(
            lens in proptest::collection::vec(0usize..40, 1..4),
            payload_max in 1usize..9,
        ) {
            let mut cache = ReassemblyCache::new(&Limits::default());
            let ids: Vec<Correlation> = lens.iter().map(|_| Correlation::new()).collect();
            let mut queues: Vec<_> = ids
                .iter()
                .zip(&lens)
                .map(|(id, len)| segments(*id, *len, payload_max).into_iter())
                .collect();

            // Round-robin keeps per-correlation order while mixing messages.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for queue in &mut queues {
                    if let Some(part) = queue.next() {
                        cache.add_segment(part).unwrap();
                        progressed = true;
                    }
                }
            }

            for (id, len) in ids.iter().zip(&lens) {
                let msg = cache.take_matching(|m| m.correlation() == *id).unwrap();
                let expected: Vec<u8> = (0..*len).map(|i| i as u8).collect();
                proptest::prop_assert_eq!(msg.payload(), expected.as_slice());
            }
            proptest::prop_assert!(cache.is_empty());
            proptest::prop_assert_eq!(cache.reserved_bytes(), 0);
        }
    }

    #[test]
    fn gap_is_reported_and_message_dropped() {
        let mut cache = ReassemblyCache::new(&limits());
        let c = Correlation::new();
        let parts = segments(c, 12, 4);
        cache.add_segment(parts[0].clone()).unwrap();
        let err = cache.add_segment(parts[2].clone()).unwrap_err();
        assert!(matches!(err, CacheError::Inconsistent { .. }));
        assert!(cache.is_empty());
    }
}

//! Transport and coordinator safety limits.

use serde::{Deserialize, Serialize};

/// Limits bound every buffer the transport layer can grow.
///
/// Values are explicit about their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Upper bound of bytes reserved by partially or fully reassembled messages.
    pub max_cache_bytes: usize,
    pub max_cache_messages: usize,
    /// Correlations remembered as discarded; the oldest is forgotten first.
    pub max_discarded: usize,

    /// Largest frame accepted on a gateway byte stream.
    pub max_stream_frame_bytes: usize,
    /// Bytes pulled from a stream per read call.
    pub stream_read_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cache_bytes: 64 * 1024 * 1024,
            max_cache_messages: 4096,
            max_discarded: 1024,
            max_stream_frame_bytes: 16 * 1024 * 1024,
            stream_read_bytes: 64 * 1024,
        }
    }
}

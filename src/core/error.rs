//! Core capability errors (identity parsing and validation).
//!
//! These are bounded and stable: core errors represent refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("resource id `{raw}` is invalid: {reason}")]
    Resource { raw: i64, reason: String },
    #[error("trid `{raw}` is invalid: {reason}")]
    Trid { raw: String, reason: String },
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

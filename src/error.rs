use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::tm::{LogError, ManagerError, ProtoDecodeError, RegistryError};
use crate::transport::TransportError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error over the capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Config(e) => e.transience(),
            Error::Transport(e) => e.transience(),
            Error::Log(e) => e.transience(),
            Error::Manager(e) => e.transience(),
            Error::Registry(_) | Error::Decode(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Config(e) => e.effect(),
            Error::Transport(e) => e.effect(),
            Error::Log(e) => e.effect(),
            Error::Manager(e) => e.effect(),
            Error::Registry(_) | Error::Decode(_) => Effect::None,
        }
    }
}

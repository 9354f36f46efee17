#![forbid(unsafe_code)]

//! Two-phase commit transaction manager over a segmented message transport.
//!
//! - `transport`: segments, reassembly, devices, local and stream transports
//! - `tm`: resource proxies, transaction table, coordinator, persistent log
//! - `config`, `telemetry`, `paths`: service plumbing

pub mod config;
pub mod core;
pub mod error;
pub mod paths;
pub mod service;
pub mod telemetry;
pub mod tm;
pub mod transport;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    Correlation, Limits, Pid, ProcessHandle, QueueId, ResourceId, Trid, XaCode,
};

//! Core atoms shared by the transport and the transaction manager
//!
//! - identity: Correlation, Pid, QueueId, ProcessHandle, ResourceId, Trid
//! - xa: XaCode and the severity ranking
//! - limits: buffer bounds
//! - error: CoreError

pub mod error;
pub mod identity;
pub mod limits;
pub mod xa;

pub use error::{CoreError, InvalidId};
pub use identity::{Correlation, Pid, ProcessHandle, QueueId, ResourceId, TRID_FORMAT, Trid};
pub use limits::Limits;
pub use xa::XaCode;

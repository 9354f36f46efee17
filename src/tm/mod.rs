//! Transaction manager: a two-phase commit coordinator over resource proxies.
//!
//! - message: protocol messages and their CBOR bodies
//! - proxy: resource proxies, instances and statistics
//! - state: transaction table and pending queues
//! - log: persistent transaction log (sqlite)
//! - manager/handle: the coordinator actor
//! - admin: read-only snapshot for operators

pub mod admin;
mod handle;
pub mod log;
pub mod manager;
pub mod message;
pub mod proxy;
pub mod state;

pub use admin::Snapshot;
pub use log::{
    BeginMeta, LogDurability, LogError, LogRow, LogState, MemoryTransactionLog,
    SqliteTransactionLog, TransactionLog,
};
pub use manager::{Control, Manager, ManagerError, Recovery};
pub use message::{ProtoDecodeError, ProtoEncodeError, TmMessage, kind};
pub use proxy::{InstanceState, ProxyConfig, Registry, RegistryError, Statistics, Stats};
pub use state::{Decision, OwnerPhase, Stage, State};

//! Identity atoms
//!
//! Correlation: 128-bit id tying the segments and replies of one message together
//! Pid, QueueId, ProcessHandle: where a process can be reached
//! ResourceId: configured resource proxy (local > 0, remote < 0)
//! Trid: global transaction id + branch + format

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

/// Correlation id carried by every segment of a logical message.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Correlation(Uuid);

impl Correlation {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Correlation({})", self.0.simple())
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Operating-system process id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an inbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(u64);

impl QueueId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// A process together with the queue it reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub queue: QueueId,
}

impl ProcessHandle {
    pub fn new(pid: Pid, queue: QueueId) -> Self {
        Self { pid, queue }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.queue)
    }
}

/// Resource proxy id.
///
/// Positive ids are configured local resources, negative ids are external
/// proxies (gateways acting as resource managers for a remote domain).
/// Zero is never a valid id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct ResourceId(i32);

impl ResourceId {
    pub fn new(raw: i32) -> Result<Self, CoreError> {
        if raw == 0 {
            return Err(InvalidId::Resource {
                raw: i64::from(raw),
                reason: "zero is reserved".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_local(self) -> bool {
        self.0 > 0
    }

    pub fn is_remote(self) -> bool {
        self.0 < 0
    }
}

impl TryFrom<i32> for ResourceId {
    type Error = CoreError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ResourceId> for i32 {
    fn from(id: ResourceId) -> i32 {
        id.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format id used for transactions this coordinator creates.
pub const TRID_FORMAT: i32 = 42;

/// Transaction id: global id, branch qualifier and format.
///
/// Ordering is by global id first so every branch of one global transaction
/// sorts together.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Trid {
    global: Uuid,
    branch: Uuid,
    format: i32,
}

impl Trid {
    pub fn new(format: i32, global: Uuid, branch: Uuid) -> Result<Self, CoreError> {
        if format < 0 {
            return Err(InvalidId::Trid {
                raw: format!("{}:{}:{format}", global.simple(), branch.simple()),
                reason: "negative format marks a null xid".into(),
            }
            .into());
        }
        if global.is_nil() {
            return Err(InvalidId::Trid {
                raw: format!("{}:{}:{format}", global.simple(), branch.simple()),
                reason: "nil global id".into(),
            }
            .into());
        }
        Ok(Self {
            global,
            branch,
            format,
        })
    }

    /// Fresh global transaction with its first branch.
    pub fn create() -> Self {
        Self {
            global: Uuid::new_v4(),
            branch: Uuid::new_v4(),
            format: TRID_FORMAT,
        }
    }

    /// New branch of the same global transaction.
    pub fn branch(&self) -> Self {
        Self {
            global: self.global,
            branch: Uuid::new_v4(),
            format: self.format,
        }
    }

    pub fn global(&self) -> &Uuid {
        &self.global
    }

    pub fn branch_id(&self) -> &Uuid {
        &self.branch
    }

    pub fn format(&self) -> i32 {
        self.format
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| -> CoreError {
            InvalidId::Trid {
                raw: s.to_string(),
                reason: reason.into(),
            }
            .into()
        };
        let mut parts = s.split(':');
        let (Some(global), Some(branch), Some(format), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected global:branch:format"));
        };
        let global = Uuid::parse_str(global).map_err(|_| invalid("global is not a uuid"))?;
        let branch = Uuid::parse_str(branch).map_err(|_| invalid("branch is not a uuid"))?;
        let format = format
            .parse::<i32>()
            .map_err(|_| invalid("format is not an integer"))?;
        Self::new(format, global, branch)
    }
}

impl fmt::Debug for Trid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trid({self})")
    }
}

impl fmt::Display for Trid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.global.simple(),
            self.branch.simple(),
            self.format
        )
    }
}

//! Transaction table and the coordinator's queues.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::core::{Correlation, Pid, ProcessHandle, QueueId, ResourceId, Trid, XaCode};
use crate::transport::CompleteMessage;

use super::log::LogState;
use super::message::{ResourceReply, TmMessage};
use super::proxy::Registry;

/// Where one resource is in the coordinator's script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Involved,
    PrepareRequested,
    PrepareReplied,
    CommitRequested,
    CommitReplied,
    RollbackRequested,
    RollbackReplied,
    Done,
    Error,
    NotInvolved,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::Involved => 0,
            Stage::PrepareRequested => 1,
            Stage::PrepareReplied => 2,
            Stage::CommitRequested | Stage::RollbackRequested => 3,
            Stage::CommitReplied | Stage::RollbackReplied => 4,
            Stage::Done | Stage::Error | Stage::NotInvolved => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 5
    }

    /// A request is out and its reply has not arrived.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Stage::PrepareRequested | Stage::CommitRequested | Stage::RollbackRequested
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Involved => "involved",
            Stage::PrepareRequested => "prepare_requested",
            Stage::PrepareReplied => "prepare_replied",
            Stage::CommitRequested => "commit_requested",
            Stage::CommitReplied => "commit_replied",
            Stage::RollbackRequested => "rollback_requested",
            Stage::RollbackReplied => "rollback_replied",
            Stage::Done => "done",
            Stage::Error => "error",
            Stage::NotInvolved => "not_involved",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource enlisted in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    stage: Stage,
    result: Option<XaCode>,
    /// Instance currently handling a request for this resource.
    pub instance: Option<Pid>,
    pub requested_at: Option<Instant>,
}

impl Resource {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            stage: Stage::Involved,
            result: None,
            instance: None,
            requested_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move forward in the script; a step backwards or sideways is refused.
    pub fn advance(&mut self, next: Stage) -> bool {
        if next.rank() <= self.stage.rank() {
            tracing::warn!(resource = %self.id, from = %self.stage, to = %next, "refused stage regression");
            return false;
        }
        self.stage = next;
        if !next.is_in_flight() {
            self.instance = None;
            self.requested_at = None;
        }
        true
    }

    /// Most severe result seen across both phases.
    pub fn result(&self) -> Option<XaCode> {
        self.result
    }

    pub fn record(&mut self, code: XaCode) {
        self.result = Some(match self.result {
            Some(current) => current.most_severe(code),
            None => code,
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Commit,
    Rollback,
}

/// What the caller asked for and where its reply goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerRequest {
    pub decision: Decision,
    pub target: ProcessHandle,
    pub correlation: Correlation,
}

/// A phase the owning domain asked this domain to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerPhase {
    Prepare,
    Commit,
    Rollback,
}

impl OwnerPhase {
    /// The reply that answers this phase.
    pub fn reply(self, body: ResourceReply) -> TmMessage {
        match self {
            OwnerPhase::Prepare => TmMessage::PrepareReply(body),
            OwnerPhase::Commit => TmMessage::ResourceCommitReply(body),
            OwnerPhase::Rollback => TmMessage::ResourceRollbackReply(body),
        }
    }
}

/// The owning domain's outstanding request and where its reply goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerRequest {
    pub phase: OwnerPhase,
    /// The resource id this domain acts as on the owner's side.
    pub resource: ResourceId,
    pub target: ProcessHandle,
    pub correlation: Correlation,
    pub received: Instant,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    pub trid: Trid,
    /// Process that began the transaction.
    pub process: ProcessHandle,
    /// External proxy owning the transaction, when begun in another domain.
    pub owner: Option<ResourceId>,
    pub resources: Vec<Resource>,
    pub started: Instant,
    pub deadline: Option<Instant>,
    pub request: Option<CallerRequest>,
    /// Set while the owning domain waits for a phase to finish here.
    pub owner_request: Option<OwnerRequest>,
    pub decision: Option<Decision>,
    /// Last row written to the log for this transaction.
    pub logged: Option<LogState>,
    /// Rolled back because the deadline passed.
    pub timed_out: bool,
    /// Outcome logged and reply queued; removed after the next persist.
    pub finalized: bool,
}

impl Transaction {
    pub fn new(trid: Trid, process: ProcessHandle, started: Instant) -> Self {
        Self {
            trid,
            process,
            owner: None,
            resources: Vec::new(),
            started,
            deadline: None,
            request: None,
            owner_request: None,
            decision: None,
            logged: None,
            timed_out: false,
            finalized: false,
        }
    }

    /// Enlist a resource once; returns false when it already was.
    pub fn involve(&mut self, id: ResourceId) -> bool {
        if self.resources.iter().any(|r| r.id == id) {
            return false;
        }
        self.resources.push(Resource::new(id));
        true
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.id == id)
    }

    /// Every prepare request has been answered.
    pub fn prepare_complete(&self) -> bool {
        self.resources.iter().all(|r| {
            matches!(
                r.stage,
                Stage::PrepareReplied | Stage::Done | Stage::Error | Stage::NotInvolved
            )
        })
    }

    /// Every resource reached `done` or `error`.
    pub fn resolved(&self) -> bool {
        self.resources.iter().all(|r| r.stage.is_terminal())
    }

    /// Prepare results allow a commit.
    pub fn prepared_ok(&self) -> bool {
        self.resources
            .iter()
            .filter(|r| r.stage != Stage::NotInvolved)
            .all(|r| r.stage != Stage::Error && r.result.is_some_and(XaCode::is_success))
    }

    /// Every resource answered prepare with read-only.
    pub fn read_only(&self) -> bool {
        self.resources
            .iter()
            .filter(|r| r.stage != Stage::NotInvolved)
            .all(|r| r.result == Some(XaCode::ReadOnly))
    }

    /// Owned by another domain, which decides the outcome.
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// Nobody has asked for an outcome yet, so it may still be rolled back
    /// here on timeout or when its caller goes away.
    pub fn undecided(&self) -> bool {
        self.request.is_none()
            && self.owner_request.is_none()
            && self.decision.is_none()
            && self.logged != Some(LogState::Prepared)
    }

    /// The single result reported to the caller.
    pub fn outcome(&self) -> XaCode {
        let timeout = self.timed_out.then_some(XaCode::RbTimeout);
        XaCode::aggregate(self.resources.iter().filter_map(|r| r.result).chain(timeout))
    }

    pub fn in_flight_on(&self, pid: Pid) -> impl Iterator<Item = &Resource> {
        self.resources
            .iter()
            .filter(move |r| r.stage.is_in_flight() && r.instance == Some(pid))
    }
}

/// A resource request waiting for an instance (or for a persist).
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub resource: ResourceId,
    pub trid: Trid,
    pub message: TmMessage,
    pub created: Instant,
}

/// A reply waiting for a persist or for room in the target's queue.
#[derive(Clone, Debug)]
pub struct PendingReply {
    pub target: QueueId,
    pub message: CompleteMessage,
    pub created: Instant,
}

/// Released only after the log has persisted.
#[derive(Debug, Default)]
pub struct Persistent {
    pub replies: Vec<PendingReply>,
    pub requests: Vec<PendingRequest>,
}

/// Waiting on an idle instance or a non-full queue.
#[derive(Debug, Default)]
pub struct Pending {
    pub requests: VecDeque<PendingRequest>,
    pub replies: VecDeque<PendingReply>,
}

/// Everything the coordinator owns.
#[derive(Debug, Default)]
pub struct State {
    pub transactions: BTreeMap<Trid, Transaction>,
    pub registry: Registry,
    pub persistent: Persistent,
    pub pending: Pending,
}

impl State {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    /// Anything queued that the loop should retry without blocking.
    ///
    /// Requests waiting for an idle instance are not counted: only an
    /// inbound message can free an instance.
    pub fn outstanding(&self) -> bool {
        !self.persistent.replies.is_empty()
            || !self.persistent.requests.is_empty()
            || !self.pending.replies.is_empty()
            || self.transactions.values().any(|t| t.finalized)
    }

    /// Earliest transaction deadline still able to expire.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transactions
            .values()
            .filter(|t| t.undecided())
            .filter_map(|t| t.deadline)
            .min()
    }
}

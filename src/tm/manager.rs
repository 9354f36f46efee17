//! The transaction coordinator actor.
//!
//! One `Manager` owns the transaction table, the proxy registry and the log.
//! It is driven by messages read from its inbound device; every mutation
//! happens on the thread running [`Manager::run`].
//!
//! Replies and commit requests that depend on a log write are parked in
//! `persistent` queues and only released after `TransactionLog::persist`
//! returns.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{Correlation, ProcessHandle, QueueId, ResourceId, Trid, XaCode};
use crate::error::{Effect, Transience};
use crate::transport::{
    CompleteMessage, Connector, InboundDevice, Matcher, OutboundDevice, Policy, TransportError,
    TransportReader, TransportWriter,
};

use super::admin::Snapshot;
use super::log::{BeginMeta, LogError, LogState, TransactionLog};
use super::message::{CallerReply, ProtoEncodeError, ResourceReply, ResourceRequest, TmMessage};
use super::proxy::{InstanceState, Registry, RegistryError};
use super::state::{
    Decision, OwnerPhase, OwnerRequest, PendingReply, PendingRequest, Stage, State, Transaction,
};

/// Receive timeout while queued work waits for a retry.
const OUTSTANDING_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// The log failed; no outcome depending on it can be released.
    #[error("transaction log failed: {0}")]
    Log(#[from] LogError),
    #[error("inbound transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),
    /// The thread running the loop panicked; nothing is known about the
    /// work it had in hand.
    #[error("transaction manager thread panicked: {0}")]
    Panicked(String),
}

impl ManagerError {
    pub fn transience(&self) -> Transience {
        match self {
            ManagerError::Log(e) => e.transience(),
            ManagerError::Transport(e) => e.transience(),
            ManagerError::Encode(_) => Transience::Permanent,
            ManagerError::Panicked(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ManagerError::Log(e) => e.effect(),
            ManagerError::Transport(e) => e.effect(),
            ManagerError::Encode(_) => Effect::None,
            ManagerError::Panicked(_) => Effect::Unknown,
        }
    }
}

/// Whether the loop keeps going after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

/// Result of the startup scan over the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Began but never decided; logged as rolled back.
    pub aborted: Vec<Trid>,
    /// Decided but never completed; needs an operator.
    pub in_doubt: Vec<Trid>,
}

enum Dispatch {
    Sent,
    Pending,
    /// The resource no longer waits for this request.
    Stale,
    Failed,
}

type Writer = OutboundDevice<Box<dyn TransportWriter + Send>>;

pub struct Manager<L, C> {
    pub(super) state: State,
    pub(super) log: L,
    connector: C,
    writers: HashMap<QueueId, Writer>,
    /// Where resource replies are sent.
    pub(super) process: ProcessHandle,
    pub(super) default_timeout: Option<Duration>,
}

impl<L: TransactionLog, C: Connector> Manager<L, C> {
    pub fn new(process: ProcessHandle, registry: Registry, log: L, connector: C) -> Self {
        Self {
            state: State::new(registry),
            log,
            connector,
            writers: HashMap::new(),
            process,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.state, Instant::now())
    }

    /// Serve until a shutdown message arrives or something fatal happens.
    pub fn run<R: TransportReader>(
        &mut self,
        inbound: &mut InboundDevice<R>,
    ) -> Result<(), ManagerError> {
        tracing::info!(process = %self.process, "transaction manager started");
        loop {
            let now = Instant::now();
            self.expire(now)?;
            self.flush(now)?;

            let policy = if self.state.outstanding() {
                Policy::Timeout(OUTSTANDING_POLL)
            } else if let Some(deadline) = self.state.next_deadline() {
                Policy::Timeout(deadline.saturating_duration_since(now))
            } else {
                Policy::Blocking
            };

            let received = inbound.receive_with(&Matcher::Any, policy, |err| {
                if err.is_recoverable() {
                    tracing::warn!(error = %err, "dropped inbound segment");
                    Ok(())
                } else {
                    Err(err)
                }
            })?;
            let Some(message) = received else {
                continue;
            };
            if self.handle(message, Instant::now())? == Control::Shutdown {
                self.flush(Instant::now())?;
                tracing::info!(
                    transactions = self.state.transactions.len(),
                    "transaction manager stopped"
                );
                return Ok(());
            }
        }
    }

    /// Persist the log, then release everything that waited on it and retry
    /// pending sends.
    pub fn flush(&mut self, now: Instant) -> Result<(), ManagerError> {
        let persistent = &self.state.persistent;
        let finalized = self.state.transactions.values().any(|t| t.finalized);
        if !persistent.replies.is_empty() || !persistent.requests.is_empty() || finalized {
            self.log.persist()?;

            let replies = std::mem::take(&mut self.state.persistent.replies);
            for reply in replies {
                self.send_reply(reply);
            }
            let requests = std::mem::take(&mut self.state.persistent.requests);
            let mut failed = Vec::new();
            for request in requests {
                let trid = request.trid;
                if let Dispatch::Failed = self.dispatch(request, now)? {
                    failed.push(trid);
                }
            }
            self.state.transactions.retain(|trid, trx| {
                if trx.finalized {
                    tracing::debug!(%trid, "transaction removed");
                }
                !trx.finalized
            });
            for trid in failed {
                self.evaluate(&trid, now)?;
            }
        }

        let replies = std::mem::take(&mut self.state.pending.replies);
        for reply in replies {
            self.send_reply(reply);
        }
        self.retry_pending(None, now)
    }

    /// Dispatch waiting requests, for one resource or for all.
    pub(super) fn retry_pending(
        &mut self,
        resource: Option<ResourceId>,
        now: Instant,
    ) -> Result<(), ManagerError> {
        if self.state.pending.requests.is_empty() {
            return Ok(());
        }
        let waiting = std::mem::take(&mut self.state.pending.requests);
        let mut failed = Vec::new();
        for request in waiting {
            let eligible = resource.is_none_or(|id| id == request.resource);
            if !eligible {
                self.state.pending.requests.push_back(request);
                continue;
            }
            let trid = request.trid;
            if let Dispatch::Failed = self.dispatch(request, now)? {
                failed.push(trid);
            }
        }
        for trid in failed {
            self.evaluate(&trid, now)?;
        }
        Ok(())
    }

    /// Roll back transactions whose deadline passed before anyone asked for
    /// an outcome.
    pub fn expire(&mut self, now: Instant) -> Result<(), ManagerError> {
        let expired: Vec<Trid> = self
            .state
            .transactions
            .values()
            .filter(|t| t.undecided())
            .filter(|t| t.deadline.is_some_and(|deadline| deadline <= now))
            .map(|t| t.trid)
            .collect();
        for trid in expired {
            tracing::warn!(%trid, "transaction timed out; rolling back");
            if let Some(trx) = self.state.transactions.get_mut(&trid) {
                trx.timed_out = true;
            }
            self.decide(&trid, Decision::Rollback)?;
            self.evaluate(&trid, now)?;
        }
        Ok(())
    }

    /// Scan the log for transactions a previous run left behind.
    ///
    /// Transactions that only began are presumed aborted and logged as rolled
    /// back. Transactions that were decided but never completed are reported
    /// as in doubt.
    pub fn recover(&mut self) -> Result<Recovery, ManagerError> {
        let mut last: BTreeMap<Trid, LogState> = BTreeMap::new();
        for row in self.log.select_all()? {
            last.insert(row.trid, row.state);
        }

        let mut recovery = Recovery::default();
        for (trid, state) in last {
            match state {
                LogState::Began => {
                    self.log.rollback(&trid)?;
                    recovery.aborted.push(trid);
                }
                LogState::Prepared => {
                    tracing::error!(%trid, "transaction in doubt: decided but never completed");
                    recovery.in_doubt.push(trid);
                }
                LogState::Committed | LogState::RolledBack => {}
            }
        }
        if !recovery.aborted.is_empty() {
            self.log.persist()?;
            tracing::info!(aborted = recovery.aborted.len(), "presumed abort for unfinished transactions");
        }
        Ok(recovery)
    }

    /// Change how many instances a proxy should run; surplus idle instances
    /// are told to shut down.
    pub fn scale(&mut self, id: ResourceId, instances: usize) -> Result<(), RegistryError> {
        let stopping = self.state.registry.scale(id, instances)?;
        for process in stopping {
            let message = match TmMessage::Shutdown.to_complete(Correlation::new()) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(error = %err, "could not encode shutdown");
                    continue;
                }
            };
            self.send_reply(PendingReply {
                target: process.queue,
                message,
                created: Instant::now(),
            });
        }
        Ok(())
    }

    /// Write the begin row once, with every resource enlisted so far.
    pub(super) fn log_begin(&mut self, trid: &Trid) -> Result<(), ManagerError> {
        let Some(trx) = self.state.transactions.get_mut(trid) else {
            return Ok(());
        };
        if trx.logged.is_some() {
            return Ok(());
        }
        let meta = BeginMeta {
            owner: trx.owner,
            resources: trx.resources.iter().map(|r| r.id).collect(),
        };
        self.log.begin(trid, &meta)?;
        trx.logged = Some(LogState::Began);
        Ok(())
    }

    /// Fix the outcome without a prepare phase.
    pub(super) fn decide(&mut self, trid: &Trid, decision: Decision) -> Result<(), ManagerError> {
        self.log_begin(trid)?;
        if let Some(trx) = self.state.transactions.get_mut(trid)
            && trx.decision.is_none()
        {
            trx.decision = Some(decision);
        }
        Ok(())
    }

    /// Send prepare requests to every resource not yet asked.
    pub(super) fn prepare(&mut self, trid: &Trid, now: Instant) -> Result<(), ManagerError> {
        let Some(trx) = self.state.transactions.get_mut(trid) else {
            return Ok(());
        };
        let mut requests = Vec::new();
        for resource in &mut trx.resources {
            if resource.stage() == Stage::Involved && resource.advance(Stage::PrepareRequested) {
                requests.push(resource.id);
            }
        }
        for id in requests {
            let message = TmMessage::Prepare(self.resource_request(trid, id));
            self.dispatch(
                PendingRequest {
                    resource: id,
                    trid: *trid,
                    message,
                    created: now,
                },
                now,
            )?;
        }
        Ok(())
    }

    /// Move the transaction forward as far as its resources allow.
    pub(super) fn evaluate(&mut self, trid: &Trid, now: Instant) -> Result<(), ManagerError> {
        let Some(trx) = self.state.transactions.get_mut(trid) else {
            return Ok(());
        };
        if trx.finalized {
            return Ok(());
        }

        let decision = match trx.decision {
            Some(decision) => decision,
            None if trx.is_owned() => {
                let preparing = trx
                    .owner_request
                    .is_some_and(|r| r.phase == OwnerPhase::Prepare);
                if !preparing || !trx.prepare_complete() {
                    return Ok(());
                }
                if trx.prepared_ok() && !trx.read_only() {
                    return self.prepared_for_owner(trid, now);
                }
                // Read-only or failed: this domain is done either way and the
                // prepare reply carries the outcome.
                let decision = if trx.prepared_ok() {
                    Decision::Commit
                } else {
                    Decision::Rollback
                };
                trx.decision = Some(decision);
                tracing::info!(%trid, ?decision, "prepare for owner ended locally");
                decision
            }
            None => {
                let commit_requested = trx
                    .request
                    .is_some_and(|r| r.decision == Decision::Commit);
                if !commit_requested || !trx.prepare_complete() {
                    return Ok(());
                }
                let decision = if trx.prepared_ok() {
                    Decision::Commit
                } else {
                    Decision::Rollback
                };
                trx.decision = Some(decision);
                self.log.prepare_commit(trid)?;
                if let Some(trx) = self.state.transactions.get_mut(trid) {
                    trx.logged = Some(LogState::Prepared);
                }
                tracing::info!(%trid, ?decision, "prepare phase complete");
                decision
            }
        };

        self.phase_two(trid, decision, now)?;

        let resolved = self
            .state
            .transactions
            .get(trid)
            .is_some_and(Transaction::resolved);
        if resolved {
            self.finalize(trid, now)?;
        }
        Ok(())
    }

    /// Every resource prepared: log it and answer the owner, who decides.
    fn prepared_for_owner(&mut self, trid: &Trid, now: Instant) -> Result<(), ManagerError> {
        self.log.prepare_commit(trid)?;
        let process = self.process;
        let Some(trx) = self.state.transactions.get_mut(trid) else {
            return Ok(());
        };
        trx.logged = Some(LogState::Prepared);
        let outcome = trx.outcome();
        if let Some(request) = trx.owner_request.take() {
            let reply = owner_reply(process, *trid, &request, outcome, now)?;
            self.state.persistent.replies.push(reply);
        }
        tracing::info!(%trid, outcome = %outcome, "prepared for owning domain");
        Ok(())
    }

    /// Ask every resource that has not been asked yet to commit or roll back.
    ///
    /// Read-only resources are done after prepare. Commit requests wait for
    /// the prepared row to persist.
    fn phase_two(
        &mut self,
        trid: &Trid,
        decision: Decision,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let Some(trx) = self.state.transactions.get_mut(trid) else {
            return Ok(());
        };
        let requested = match decision {
            Decision::Commit => Stage::CommitRequested,
            Decision::Rollback => Stage::RollbackRequested,
        };
        let mut targets = Vec::new();
        for resource in &mut trx.resources {
            if !matches!(resource.stage(), Stage::Involved | Stage::PrepareReplied) {
                continue;
            }
            if resource.result() == Some(XaCode::ReadOnly) {
                resource.advance(Stage::Done);
                continue;
            }
            if resource.advance(requested) {
                targets.push(resource.id);
            }
        }

        for id in targets {
            let body = self.resource_request(trid, id);
            let message = match decision {
                Decision::Commit => TmMessage::ResourceCommit(body),
                Decision::Rollback => TmMessage::ResourceRollback(body),
            };
            let request = PendingRequest {
                resource: id,
                trid: *trid,
                message,
                created: now,
            };
            match decision {
                Decision::Commit => self.state.persistent.requests.push(request),
                Decision::Rollback => {
                    self.dispatch(request, now)?;
                }
            }
        }
        Ok(())
    }

    /// Log the outcome and queue the caller's reply behind the next persist.
    fn finalize(&mut self, trid: &Trid, now: Instant) -> Result<(), ManagerError> {
        let Some(trx) = self.state.transactions.get(trid) else {
            return Ok(());
        };
        let decision = trx.decision.unwrap_or(Decision::Rollback);
        let outcome = trx.outcome();
        let request = trx.request;
        let owner_request = trx.owner_request;

        self.log_begin(trid)?;
        match decision {
            Decision::Commit => self.log.commit(trid)?,
            Decision::Rollback => self.log.rollback(trid)?,
        }

        if let Some(request) = request {
            let reply = CallerReply {
                trid: *trid,
                state: outcome,
            };
            let message = match request.decision {
                Decision::Commit => TmMessage::CommitReply(reply),
                Decision::Rollback => TmMessage::RollbackReply(reply),
            };
            self.state.persistent.replies.push(PendingReply {
                target: request.target.queue,
                message: message.to_complete(request.correlation)?,
                created: now,
            });
        }

        if let Some(owner) = owner_request {
            let reply = owner_reply(self.process, *trid, &owner, outcome, now)?;
            self.state.persistent.replies.push(reply);
        }

        if let Some(trx) = self.state.transactions.get_mut(trid) {
            trx.owner_request = None;
            trx.logged = Some(match decision {
                Decision::Commit => LogState::Committed,
                Decision::Rollback => LogState::RolledBack,
            });
            trx.finalized = true;
        }
        tracing::info!(%trid, ?decision, outcome = %outcome, "transaction finalized");
        Ok(())
    }

    fn resource_request(&self, trid: &Trid, resource: ResourceId) -> ResourceRequest {
        ResourceRequest {
            trid: *trid,
            resource,
            process: self.process,
            flags: 0,
        }
    }

    /// Send a request to an instance of its resource, or park it.
    ///
    /// `Failed` means the resource cannot be reached at all and was marked
    /// in error; the caller re-evaluates the transaction.
    fn dispatch(&mut self, request: PendingRequest, now: Instant) -> Result<Dispatch, ManagerError> {
        let Some(stage) = self
            .state
            .transactions
            .get(&request.trid)
            .and_then(|t| t.resource(request.resource))
            .map(|r| r.stage())
        else {
            tracing::debug!(trid = %request.trid, resource = %request.resource, "dropped request for finished transaction");
            return Ok(Dispatch::Stale);
        };
        if !stage.is_in_flight() {
            return Ok(Dispatch::Stale);
        }

        if request.resource.is_remote() {
            return self.dispatch_external(request, now);
        }
        if self.state.registry.proxy(request.resource).is_none() {
            tracing::error!(trid = %request.trid, resource = %request.resource, "request for unconfigured resource");
            self.fail_resource(&request.trid, request.resource, XaCode::RmErr);
            return Ok(Dispatch::Failed);
        }

        let message = request.message.to_complete(Correlation::new())?;
        while let Some(target) = self.state.registry.first_idle(request.resource) {
            match self.send(target.queue, message.clone()) {
                Ok(true) => {
                    if let Err(err) = self.state.registry.reserve(target.pid, now) {
                        tracing::warn!(error = %err, "could not mark instance busy");
                    }
                    if let Some(proxy) = self.state.registry.proxy_mut(request.resource) {
                        proxy.pending.time(request.created, now);
                    }
                    if let Some(resource) = self
                        .state
                        .transactions
                        .get_mut(&request.trid)
                        .and_then(|t| t.resource_mut(request.resource))
                    {
                        resource.instance = Some(target.pid);
                        resource.requested_at = Some(now);
                    }
                    tracing::debug!(trid = %request.trid, resource = %request.resource, instance = %target, kind = %request.message.message_type(), "request dispatched");
                    return Ok(Dispatch::Sent);
                }
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!(instance = %target, error = %err, "instance unreachable; marked in error");
                    if let Err(err) = self
                        .state
                        .registry
                        .instance_state_changed(target.pid, InstanceState::Error)
                    {
                        tracing::warn!(error = %err, "could not mark instance in error");
                        break;
                    }
                }
            }
        }

        tracing::debug!(trid = %request.trid, resource = %request.resource, "no idle instance; request pending");
        self.state.pending.requests.push_back(request);
        Ok(Dispatch::Pending)
    }

    fn dispatch_external(
        &mut self,
        request: PendingRequest,
        now: Instant,
    ) -> Result<Dispatch, ManagerError> {
        let Some(process) = self
            .state
            .registry
            .external(request.resource)
            .map(|e| e.process)
        else {
            tracing::error!(trid = %request.trid, resource = %request.resource, "external resource is gone");
            self.fail_resource(&request.trid, request.resource, XaCode::RmFail);
            return Ok(Dispatch::Failed);
        };
        let message = request.message.to_complete(Correlation::new())?;
        match self.send(process.queue, message) {
            Ok(true) => {
                if let Some(resource) = self
                    .state
                    .transactions
                    .get_mut(&request.trid)
                    .and_then(|t| t.resource_mut(request.resource))
                {
                    resource.instance = Some(process.pid);
                    resource.requested_at = Some(now);
                }
                Ok(Dispatch::Sent)
            }
            Ok(false) => {
                self.state.pending.requests.push_back(request);
                Ok(Dispatch::Pending)
            }
            Err(err) => {
                tracing::error!(trid = %request.trid, resource = %request.resource, error = %err, "external resource unreachable");
                self.fail_resource(&request.trid, request.resource, XaCode::RmFail);
                Ok(Dispatch::Failed)
            }
        }
    }

    /// Record a failure for one resource of a transaction and end its script.
    pub(super) fn fail_resource(&mut self, trid: &Trid, id: ResourceId, code: XaCode) {
        if let Some(resource) = self
            .state
            .transactions
            .get_mut(trid)
            .and_then(|t| t.resource_mut(id))
        {
            resource.record(code);
            resource.advance(Stage::Error);
        }
    }

    /// Reply straight away; used for answers that depend on no log write.
    pub(super) fn reply_now(
        &mut self,
        target: ProcessHandle,
        message: TmMessage,
        correlation: Correlation,
        now: Instant,
    ) -> Result<(), ManagerError> {
        self.send_reply(PendingReply {
            target: target.queue,
            message: message.to_complete(correlation)?,
            created: now,
        });
        Ok(())
    }

    fn send_reply(&mut self, reply: PendingReply) {
        match self.send(reply.target, reply.message.clone()) {
            Ok(true) => {}
            Ok(false) => self.state.pending.replies.push_back(reply),
            Err(err) => {
                tracing::warn!(
                    queue = %reply.target,
                    correlation = %reply.message.correlation(),
                    error = %err,
                    "reply dropped; caller unreachable"
                );
            }
        }
    }

    /// Non-blocking send; `Ok(false)` when the target queue is full.
    fn send(&mut self, queue: QueueId, message: CompleteMessage) -> Result<bool, TransportError> {
        let writer = match self.writers.entry(queue) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(OutboundDevice::new(self.connector.connect(queue)?))
            }
        };
        match writer.put_message(message, Policy::NonBlocking) {
            Ok(sent) => Ok(sent.is_some()),
            Err(err) => {
                self.writers.remove(&queue);
                Err(err)
            }
        }
    }

    /// Forget the cached writer for a queue whose owner is gone.
    pub(super) fn disconnect(&mut self, queue: QueueId) {
        self.writers.remove(&queue);
    }
}

/// Answer the owning domain's request, as the resource it knows us by.
fn owner_reply(
    process: ProcessHandle,
    trid: Trid,
    request: &OwnerRequest,
    state: XaCode,
    now: Instant,
) -> Result<PendingReply, ManagerError> {
    let elapsed = now.saturating_duration_since(request.received).as_micros();
    let body = ResourceReply {
        trid,
        resource: request.resource,
        process,
        state,
        elapsed_us: Some(u64::try_from(elapsed).unwrap_or(u64::MAX)),
    };
    Ok(PendingReply {
        target: request.target.queue,
        message: request.phase.reply(body).to_complete(request.correlation)?,
        created: now,
    })
}

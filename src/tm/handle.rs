//! Per-message handlers of the coordinator.

use std::time::{Duration, Instant};

use crate::core::{Correlation, Pid, XaCode};
use crate::transport::{CompleteMessage, Connector};

use super::log::{LogState, TransactionLog};
use super::manager::{Control, Manager, ManagerError};
use super::message::{
    CallerReply, CallerRequest, Involved, ResourceConnect, ResourceReply, ResourceRequest,
    TmMessage,
};
use super::state::{self, Decision, OwnerPhase, OwnerRequest, PendingReply, Stage, Transaction};

impl<L: TransactionLog, C: Connector> Manager<L, C> {
    /// Handle one inbound message.
    ///
    /// Malformed and unexpected messages are logged and dropped; only a log
    /// failure ends the coordinator.
    pub fn handle(
        &mut self,
        message: CompleteMessage,
        now: Instant,
    ) -> Result<Control, ManagerError> {
        let correlation = message.correlation();
        let decoded = match TmMessage::from_complete(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(%correlation, kind = %message.message_type(), error = %err, "dropped malformed message");
                return Ok(Control::Continue);
            }
        };
        tracing::trace!(%correlation, kind = %message.message_type(), "handling message");

        match decoded {
            TmMessage::Involved(msg) => self.involved(msg, now),
            TmMessage::ExternalInvolved(msg) => self.external_involved(msg, now),
            TmMessage::Commit(msg) => self.commit(msg, correlation, now)?,
            TmMessage::Rollback(msg) => self.rollback(msg, correlation, now)?,
            TmMessage::PrepareReply(msg) => {
                self.resource_reply(msg, Stage::PrepareRequested, now)?
            }
            TmMessage::ResourceCommitReply(msg) => {
                self.resource_reply(msg, Stage::CommitRequested, now)?
            }
            TmMessage::ResourceRollbackReply(msg) => {
                self.resource_reply(msg, Stage::RollbackRequested, now)?
            }
            TmMessage::Prepare(msg) => {
                self.owner_request(msg, OwnerPhase::Prepare, correlation, now)?
            }
            TmMessage::ResourceCommit(msg) => {
                self.owner_request(msg, OwnerPhase::Commit, correlation, now)?
            }
            TmMessage::ResourceRollback(msg) => {
                self.owner_request(msg, OwnerPhase::Rollback, correlation, now)?
            }
            TmMessage::Connect(msg) => self.connect(msg, now)?,
            TmMessage::ProcessExit(pid) => self.process_exit(pid, now)?,
            TmMessage::Shutdown => {
                tracing::info!("shutdown requested");
                return Ok(Control::Shutdown);
            }
            other @ (TmMessage::CommitReply(_) | TmMessage::RollbackReply(_)) => {
                tracing::warn!(kind = %other.message_type(), "unexpected message for the coordinator");
            }
        }
        Ok(Control::Continue)
    }

    fn involved(&mut self, msg: Involved, now: Instant) {
        let default_timeout = self.default_timeout;
        let trx = self.state.transactions.entry(msg.trid).or_insert_with(|| {
            let mut trx = Transaction::new(msg.trid, msg.process, now);
            let timeout = msg.timeout_ms.map(Duration::from_millis).or(default_timeout);
            trx.deadline = timeout.map(|timeout| now + timeout);
            trx.owner = msg.owner;
            tracing::debug!(trid = %msg.trid, process = %msg.process, "transaction started");
            trx
        });
        if !trx.undecided() {
            tracing::warn!(trid = %msg.trid, "involvement after outcome was asked; ignored");
            return;
        }
        for id in msg.resources {
            if !self.state.registry.contains(id) {
                tracing::warn!(trid = %msg.trid, resource = %id, "unknown resource not involved");
                continue;
            }
            if trx.involve(id) {
                tracing::debug!(trid = %msg.trid, resource = %id, "resource involved");
            }
        }
    }

    fn external_involved(&mut self, msg: CallerRequest, now: Instant) {
        let id = self.state.registry.register_external(msg.process);
        let trx = self
            .state
            .transactions
            .entry(msg.trid)
            .or_insert_with(|| Transaction::new(msg.trid, msg.process, now));
        if !trx.undecided() {
            tracing::warn!(trid = %msg.trid, resource = %id, "external involvement after outcome was asked; ignored");
            return;
        }
        if trx.involve(id) {
            tracing::debug!(trid = %msg.trid, resource = %id, gateway = %msg.process, "external resource involved");
        }
    }

    fn commit(
        &mut self,
        msg: CallerRequest,
        correlation: Correlation,
        now: Instant,
    ) -> Result<(), ManagerError> {
        self.caller_request(msg, Decision::Commit, correlation, now)
    }

    fn rollback(
        &mut self,
        msg: CallerRequest,
        correlation: Correlation,
        now: Instant,
    ) -> Result<(), ManagerError> {
        self.caller_request(msg, Decision::Rollback, correlation, now)
    }

    fn caller_request(
        &mut self,
        msg: CallerRequest,
        decision: Decision,
        correlation: Correlation,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let trid = msg.trid;
        let reply = |state: XaCode| {
            let reply = CallerReply { trid, state };
            match decision {
                Decision::Commit => TmMessage::CommitReply(reply),
                Decision::Rollback => TmMessage::RollbackReply(reply),
            }
        };

        let Some(trx) = self.state.transactions.get_mut(&trid) else {
            tracing::warn!(%trid, ?decision, "no such transaction");
            return self.reply_now(msg.process, reply(XaCode::NotA), correlation, now);
        };
        if trx.request.is_some() {
            tracing::warn!(%trid, ?decision, "outcome already requested");
            return self.reply_now(msg.process, reply(XaCode::Proto), correlation, now);
        }
        if trx.is_owned() {
            tracing::warn!(%trid, ?decision, "outcome belongs to the owning domain");
            return self.reply_now(msg.process, reply(XaCode::Proto), correlation, now);
        }
        if trx.finalized {
            let message = reply(trx.outcome()).to_complete(correlation)?;
            self.state.persistent.replies.push(PendingReply {
                target: msg.process.queue,
                message,
                created: now,
            });
            return Ok(());
        }

        trx.request = Some(state::CallerRequest {
            decision,
            target: msg.process,
            correlation,
        });
        let undecided = trx.decision.is_none();
        tracing::info!(%trid, ?decision, resources = trx.resources.len(), "outcome requested");

        if undecided {
            match decision {
                Decision::Commit => {
                    self.log_begin(&trid)?;
                    self.prepare(&trid, now)?;
                }
                Decision::Rollback => self.decide(&trid, Decision::Rollback)?,
            }
        }
        self.evaluate(&trid, now)
    }

    /// The domain owning a transaction drives one of its phases; this domain
    /// answers as one of that domain's resources and never decides itself.
    fn owner_request(
        &mut self,
        msg: ResourceRequest,
        phase: OwnerPhase,
        correlation: Correlation,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let trid = msg.trid;
        let process = self.process;
        let refuse = move |state: XaCode| {
            phase.reply(ResourceReply {
                trid,
                resource: msg.resource,
                process,
                state,
                elapsed_us: None,
            })
        };

        let Some(trx) = self.state.transactions.get_mut(&trid) else {
            tracing::warn!(%trid, ?phase, owner = %msg.process, "owner asked about unknown transaction");
            return self.reply_now(msg.process, refuse(XaCode::NotA), correlation, now);
        };
        let prepared = trx.logged == Some(LogState::Prepared);
        let in_order = trx.owner_request.is_none()
            && trx.decision.is_none()
            && match phase {
                OwnerPhase::Prepare => !prepared,
                OwnerPhase::Commit => prepared,
                OwnerPhase::Rollback => true,
            };
        if !trx.is_owned() || !in_order {
            tracing::warn!(%trid, ?phase, owned = trx.is_owned(), prepared, "owner request refused");
            return self.reply_now(msg.process, refuse(XaCode::Proto), correlation, now);
        }

        trx.owner_request = Some(OwnerRequest {
            phase,
            resource: msg.resource,
            target: msg.process,
            correlation,
            received: now,
        });
        if phase == OwnerPhase::Commit {
            trx.decision = Some(Decision::Commit);
        }
        tracing::info!(%trid, ?phase, owner = %msg.process, resources = trx.resources.len(), "owner requested phase");

        match phase {
            OwnerPhase::Prepare => {
                self.log_begin(&trid)?;
                self.prepare(&trid, now)?;
            }
            OwnerPhase::Commit => {}
            OwnerPhase::Rollback => self.decide(&trid, Decision::Rollback)?,
        }
        self.evaluate(&trid, now)
    }

    fn resource_reply(
        &mut self,
        msg: ResourceReply,
        requested: Stage,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let replied = match requested {
            Stage::PrepareRequested => Stage::PrepareReplied,
            Stage::CommitRequested => Stage::CommitReplied,
            _ => Stage::RollbackReplied,
        };

        if msg.resource.is_local() {
            let elapsed = msg.elapsed_us.map(Duration::from_micros);
            if let Err(err) = self.state.registry.release(msg.process.pid, now, elapsed) {
                tracing::warn!(instance = %msg.process, error = %err, "reply from instance not busy");
            }
        }

        let trid = msg.trid;
        match self
            .state
            .transactions
            .get_mut(&trid)
            .and_then(|t| t.resource_mut(msg.resource))
        {
            Some(resource) if resource.stage() == requested => {
                resource.record(msg.state);
                resource.advance(replied);
                if replied != Stage::PrepareReplied {
                    let end = if msg.state.is_resource_failure() {
                        Stage::Error
                    } else {
                        Stage::Done
                    };
                    resource.advance(end);
                }
                tracing::debug!(%trid, resource = %msg.resource, state = %msg.state, stage = %resource.stage(), "resource replied");
            }
            Some(resource) => {
                tracing::warn!(%trid, resource = %msg.resource, stage = %resource.stage(), expected = %requested, "stale resource reply dropped");
            }
            None => {
                tracing::warn!(%trid, resource = %msg.resource, "reply for unknown transaction or resource");
            }
        }

        self.evaluate(&trid, now)?;
        self.retry_pending(Some(msg.resource), now)
    }

    fn connect(&mut self, msg: ResourceConnect, now: Instant) -> Result<(), ManagerError> {
        if msg.resource.is_remote() {
            let id = self.state.registry.register_external(msg.process);
            tracing::info!(resource = %id, gateway = %msg.process, "external resource connected");
            return Ok(());
        }
        match self.state.registry.instance_connected(msg.resource, msg.process) {
            Ok(previous) => {
                tracing::info!(resource = %msg.resource, instance = %msg.process, from = %previous, "instance connected");
            }
            Err(err) => {
                tracing::warn!(resource = %msg.resource, instance = %msg.process, error = %err, "connect refused");
                return Ok(());
            }
        }
        self.disconnect(msg.process.queue);
        if self.state.registry.booted() {
            tracing::debug!("every resource proxy is booted");
        }
        self.retry_pending(Some(msg.resource), now)
    }

    /// A process is gone: requests in flight on it fail, its instance leaves
    /// the registry, and transactions it began without asking for an outcome
    /// are rolled back.
    fn process_exit(&mut self, pid: Pid, now: Instant) -> Result<(), ManagerError> {
        let mut affected = Vec::new();
        for trx in self.state.transactions.values_mut() {
            let trid = trx.trid;
            let failed: Vec<_> = trx.in_flight_on(pid).map(|r| r.id).collect();
            for id in failed {
                if let Some(resource) = trx.resource_mut(id) {
                    tracing::error!(%trid, resource = %id, %pid, stage = %resource.stage(), "instance died with request in flight");
                    resource.record(XaCode::RmFail);
                    resource.advance(Stage::Error);
                }
                affected.push(trid);
            }
        }

        if let Some(instance) = self.state.registry.instance_removed(pid) {
            tracing::info!(resource = %instance.id, instance = %instance.process, "instance removed");
            self.disconnect(instance.process.queue);
        }
        let removed = self.state.registry.external_removed(pid);
        for id in &removed {
            tracing::info!(resource = %id, %pid, "external resource removed");
        }
        let mut abandoned = Vec::new();
        for trx in self.state.transactions.values_mut() {
            if !trx.owner.is_some_and(|owner| removed.contains(&owner)) {
                continue;
            }
            if trx.logged == Some(LogState::Prepared) && trx.decision.is_none() {
                tracing::error!(trid = %trx.trid, %pid, "owning domain gone after prepare; outcome in doubt");
            } else if trx.decision.is_none() {
                trx.owner_request = None;
                abandoned.push(trx.trid);
            }
        }
        for trid in abandoned {
            tracing::warn!(%trid, %pid, "owning domain gone before prepare; rolling back");
            self.decide(&trid, Decision::Rollback)?;
            affected.push(trid);
        }

        let orphaned: Vec<_> = self
            .state
            .transactions
            .values()
            .filter(|t| t.process.pid == pid && t.undecided())
            .map(|t| (t.trid, t.process.queue))
            .collect();
        for (trid, queue) in orphaned {
            tracing::warn!(%trid, %pid, "caller died before asking for an outcome; rolling back");
            self.disconnect(queue);
            self.decide(&trid, Decision::Rollback)?;
            affected.push(trid);
        }

        affected.sort();
        affected.dedup();
        for trid in affected {
            self.evaluate(&trid, now)?;
        }
        Ok(())
    }
}

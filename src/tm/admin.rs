//! Read-only view of the coordinator for operators.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::{ResourceId, XaCode};

use super::proxy::{InstanceState, Proxy, Statistics, Stats};
use super::state::{Decision, OwnerPhase, Stage, State, Transaction};

#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub proxies: Vec<ProxySnapshot>,
    pub externals: Vec<ExternalSnapshot>,
    pub transactions: Vec<TransactionSnapshot>,
    pub pending: PendingSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProxySnapshot {
    pub id: ResourceId,
    pub name: String,
    pub key: String,
    pub openinfo: String,
    pub closeinfo: String,
    pub note: String,
    pub concurrency: usize,
    pub booted: bool,
    pub statistics: StatsSnapshot,
    /// Time requests waited for an idle instance.
    pub pending: StatisticsSnapshot,
    pub instances: Vec<InstanceSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InstanceSnapshot {
    pub pid: u32,
    pub queue: u64,
    pub state: InstanceState,
    pub statistics: StatsSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExternalSnapshot {
    pub id: ResourceId,
    pub pid: u32,
    pub queue: u64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub resource: StatisticsSnapshot,
    pub roundtrip: StatisticsSnapshot,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatisticsSnapshot {
    pub invoked: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub total_us: u64,
    pub average_us: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransactionSnapshot {
    pub trid: String,
    pub owner: Option<ResourceId>,
    /// Phase the owning domain is waiting on.
    pub owner_phase: Option<OwnerPhase>,
    pub pid: u32,
    pub age_ms: u64,
    pub decision: Option<Decision>,
    pub finalized: bool,
    pub resources: Vec<ResourceSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub stage: Stage,
    pub result: Option<XaCode>,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PendingSnapshot {
    pub requests: usize,
    pub replies: usize,
    pub persistent_requests: usize,
    pub persistent_replies: usize,
}

impl Snapshot {
    pub fn capture(state: &State, now: Instant) -> Self {
        let registry = &state.registry;
        Self {
            proxies: registry.proxies().iter().map(proxy_snapshot).collect(),
            externals: registry
                .externals()
                .iter()
                .map(|e| ExternalSnapshot {
                    id: e.id,
                    pid: e.process.pid.get(),
                    queue: e.process.queue.get(),
                })
                .collect(),
            transactions: state
                .transactions
                .values()
                .map(|t| transaction_snapshot(t, now))
                .collect(),
            pending: PendingSnapshot {
                requests: state.pending.requests.len(),
                replies: state.pending.replies.len(),
                persistent_requests: state.persistent.requests.len(),
                persistent_replies: state.persistent.replies.len(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn proxy_snapshot(proxy: &Proxy) -> ProxySnapshot {
    ProxySnapshot {
        id: proxy.id,
        name: proxy.name.clone(),
        key: proxy.key.clone(),
        openinfo: proxy.openinfo.clone(),
        closeinfo: proxy.closeinfo.clone(),
        note: proxy.note.clone(),
        concurrency: proxy.concurrency,
        booted: proxy.booted(),
        statistics: stats(&proxy.total_statistics()),
        pending: statistics(&proxy.pending),
        instances: proxy
            .instances
            .iter()
            .map(|i| InstanceSnapshot {
                pid: i.process.pid.get(),
                queue: i.process.queue.get(),
                state: i.state(),
                statistics: stats(&i.statistics),
            })
            .collect(),
    }
}

fn transaction_snapshot(trx: &Transaction, now: Instant) -> TransactionSnapshot {
    TransactionSnapshot {
        trid: trx.trid.to_string(),
        owner: trx.owner,
        owner_phase: trx.owner_request.map(|r| r.phase),
        pid: trx.process.pid.get(),
        age_ms: micros(now.saturating_duration_since(trx.started)) / 1_000,
        decision: trx.decision,
        finalized: trx.finalized,
        resources: trx
            .resources
            .iter()
            .map(|r| ResourceSnapshot {
                id: r.id,
                stage: r.stage(),
                result: r.result(),
            })
            .collect(),
    }
}

fn stats(stats: &Stats) -> StatsSnapshot {
    StatsSnapshot {
        resource: statistics(&stats.resource),
        roundtrip: statistics(&stats.roundtrip),
    }
}

fn statistics(s: &Statistics) -> StatisticsSnapshot {
    StatisticsSnapshot {
        invoked: s.invoked,
        min_us: micros(s.min),
        max_us: micros(s.max),
        total_us: micros(s.total),
        average_us: micros(s.average()),
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

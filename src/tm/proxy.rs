//! Resource proxy registry.
//!
//! A proxy is a configured resource manager; its instances are the
//! processes that translate coordinator messages into XA calls. External
//! proxies are gateways acting as resource managers for another domain and
//! have negative ids.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::core::{Pid, ProcessHandle, ResourceId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("resource {id} is already registered")]
    Duplicate { id: ResourceId },
    #[error("resource {id} is not configured")]
    UnknownResource { id: ResourceId },
    #[error("no instance with pid {pid}")]
    UnknownInstance { pid: Pid },
    #[error("instance {pid} cannot go from {from} to {to}")]
    InvalidTransition {
        pid: Pid,
        from: InstanceState,
        to: InstanceState,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Absent,
    Started,
    Idle,
    Busy,
    Error,
    Shutdown,
}

impl InstanceState {
    fn can_become(self, next: InstanceState) -> bool {
        match (self, next) {
            (_, InstanceState::Error | InstanceState::Shutdown) => true,
            (InstanceState::Absent, InstanceState::Started) => true,
            (InstanceState::Absent | InstanceState::Started, InstanceState::Idle) => true,
            (InstanceState::Idle, InstanceState::Busy) | (InstanceState::Busy, InstanceState::Idle) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Absent => "absent",
            InstanceState::Started => "started",
            InstanceState::Idle => "idle",
            InstanceState::Busy => "busy",
            InstanceState::Error => "error",
            InstanceState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Min/max/total over timed invocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
    pub invoked: u64,
}

impl Statistics {
    pub fn record(&mut self, elapsed: Duration) {
        if self.invoked == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.total += elapsed;
        self.invoked += 1;
    }

    pub fn time(&mut self, start: Instant, end: Instant) {
        self.record(end.saturating_duration_since(start));
    }

    pub fn merge(&mut self, other: &Statistics) {
        if other.invoked == 0 {
            return;
        }
        if self.invoked == 0 || other.min < self.min {
            self.min = other.min;
        }
        self.max = self.max.max(other.max);
        self.total += other.total;
        self.invoked += other.invoked;
    }

    pub fn average(&self) -> Duration {
        if self.invoked == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.invoked);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Time inside the resource manager and round trip seen by the coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub resource: Statistics,
    pub roundtrip: Statistics,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.resource.merge(&other.resource);
        self.roundtrip.merge(&other.roundtrip);
    }
}

#[derive(Clone, Debug)]
pub struct Instance {
    pub id: ResourceId,
    pub process: ProcessHandle,
    pub statistics: Stats,
    state: InstanceState,
    busy_since: Option<Instant>,
}

impl Instance {
    fn new(id: ResourceId, process: ProcessHandle, state: InstanceState) -> Self {
        Self {
            id,
            process,
            statistics: Stats::default(),
            state,
            busy_since: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn busy_since(&self) -> Option<Instant> {
        self.busy_since
    }

    fn transition(&mut self, next: InstanceState) -> Result<InstanceState, RegistryError> {
        let previous = self.state;
        if !previous.can_become(next) {
            return Err(RegistryError::InvalidTransition {
                pid: self.process.pid,
                from: previous,
                to: next,
            });
        }
        if next != InstanceState::Busy {
            self.busy_since = None;
        }
        self.state = next;
        Ok(previous)
    }
}

/// Configuration of one resource proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub id: ResourceId,
    pub name: String,
    pub key: String,
    pub openinfo: String,
    pub closeinfo: String,
    pub instances: usize,
    pub note: String,
}

#[derive(Clone, Debug)]
pub struct Proxy {
    pub id: ResourceId,
    pub name: String,
    pub key: String,
    pub openinfo: String,
    pub closeinfo: String,
    pub note: String,
    /// Configured number of instances.
    pub concurrency: usize,
    /// History folded in from removed instances.
    pub statistics: Stats,
    /// Time requests waited for an idle instance.
    pub pending: Statistics,
    pub instances: Vec<Instance>,
}

impl Proxy {
    fn new(config: ProxyConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            key: config.key,
            openinfo: config.openinfo,
            closeinfo: config.closeinfo,
            note: config.note,
            concurrency: config.instances,
            statistics: Stats::default(),
            pending: Statistics::default(),
            instances: Vec::new(),
        }
    }

    /// True once every configured instance has connected.
    pub fn booted(&self) -> bool {
        let ready = self
            .instances
            .iter()
            .filter(|i| matches!(i.state, InstanceState::Idle | InstanceState::Busy))
            .count();
        ready >= self.concurrency
    }

    /// Live statistics plus the history of removed instances.
    pub fn total_statistics(&self) -> Stats {
        let mut total = self.statistics;
        for instance in &self.instances {
            total.merge(&instance.statistics);
        }
        total
    }

    fn remove_instance(&mut self, pid: Pid) -> Option<Instance> {
        let idx = self.instances.iter().position(|i| i.process.pid == pid)?;
        let instance = self.instances.remove(idx);
        self.statistics.merge(&instance.statistics);
        Some(instance)
    }
}

/// Gateway acting as a resource manager for a remote domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalProxy {
    pub id: ResourceId,
    pub process: ProcessHandle,
}

#[derive(Debug)]
pub struct Registry {
    proxies: Vec<Proxy>,
    externals: Vec<ExternalProxy>,
    next_external: i32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            proxies: Vec::new(),
            externals: Vec::new(),
            next_external: -1,
        }
    }

    pub fn register(&mut self, config: ProxyConfig) -> Result<(), RegistryError> {
        if self.proxies.iter().any(|p| p.id == config.id) {
            return Err(RegistryError::Duplicate { id: config.id });
        }
        let idx = self.proxies.partition_point(|p| p.id < config.id);
        self.proxies.insert(idx, Proxy::new(config));
        Ok(())
    }

    /// Id of the external proxy for `process`, allocated on first sight.
    pub fn register_external(&mut self, process: ProcessHandle) -> ResourceId {
        if let Some(existing) = self.externals.iter().find(|e| e.process == process) {
            return existing.id;
        }
        let id = loop {
            let raw = self.next_external;
            self.next_external = raw.checked_sub(1).unwrap_or(-1);
            if let Ok(id) = ResourceId::new(raw)
                && !self.externals.iter().any(|e| e.id == id)
            {
                break id;
            }
        };
        self.externals.push(ExternalProxy { id, process });
        tracing::debug!(resource = %id, %process, "registered external proxy");
        id
    }

    pub fn external(&self, id: ResourceId) -> Option<&ExternalProxy> {
        self.externals.iter().find(|e| e.id == id)
    }

    pub fn externals(&self) -> &[ExternalProxy] {
        &self.externals
    }

    pub fn external_removed(&mut self, pid: Pid) -> Vec<ResourceId> {
        let mut removed = Vec::new();
        self.externals.retain(|e| {
            if e.process.pid == pid {
                removed.push(e.id);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn proxy(&self, id: ResourceId) -> Option<&Proxy> {
        self.proxies.iter().find(|p| p.id == id)
    }

    pub fn proxy_mut(&mut self, id: ResourceId) -> Option<&mut Proxy> {
        self.proxies.iter_mut().find(|p| p.id == id)
    }

    /// Known resource: configured locally or an external proxy.
    pub fn contains(&self, id: ResourceId) -> bool {
        if id.is_remote() {
            self.external(id).is_some()
        } else {
            self.proxy(id).is_some()
        }
    }

    /// A process manager spawned an instance that has not connected yet.
    pub fn instance_started(
        &mut self,
        id: ResourceId,
        process: ProcessHandle,
    ) -> Result<(), RegistryError> {
        let proxy = self
            .proxy_mut(id)
            .ok_or(RegistryError::UnknownResource { id })?;
        match proxy
            .instances
            .iter_mut()
            .find(|i| i.process.pid == process.pid)
        {
            Some(instance) => {
                instance.transition(InstanceState::Started)?;
            }
            None => proxy
                .instances
                .push(Instance::new(id, process, InstanceState::Started)),
        }
        Ok(())
    }

    /// An instance connected and is ready for work.
    ///
    /// This is also the only way back to idle for an instance in error.
    pub fn instance_connected(
        &mut self,
        id: ResourceId,
        process: ProcessHandle,
    ) -> Result<InstanceState, RegistryError> {
        let proxy = self
            .proxy_mut(id)
            .ok_or(RegistryError::UnknownResource { id })?;
        match proxy
            .instances
            .iter_mut()
            .find(|i| i.process.pid == process.pid)
        {
            Some(instance) => {
                let previous = instance.state;
                if previous == InstanceState::Shutdown {
                    return Err(RegistryError::InvalidTransition {
                        pid: process.pid,
                        from: previous,
                        to: InstanceState::Idle,
                    });
                }
                if previous == InstanceState::Error {
                    tracing::info!(resource = %id, %process, "instance recovered from error");
                }
                instance.process = process;
                instance.state = InstanceState::Idle;
                instance.busy_since = None;
                Ok(previous)
            }
            None => {
                proxy
                    .instances
                    .push(Instance::new(id, process, InstanceState::Idle));
                Ok(InstanceState::Absent)
            }
        }
    }

    /// Move an instance to `state`, returning the state it left.
    ///
    /// An instance in error only returns to idle through `instance_connected`.
    pub fn instance_state_changed(
        &mut self,
        pid: Pid,
        state: InstanceState,
    ) -> Result<InstanceState, RegistryError> {
        let instance = self
            .instance_mut(pid)
            .ok_or(RegistryError::UnknownInstance { pid })?;
        instance.transition(state)
    }

    /// Mark an idle instance busy with a request sent at `now`.
    pub fn reserve(&mut self, pid: Pid, now: Instant) -> Result<(), RegistryError> {
        let instance = self
            .instance_mut(pid)
            .ok_or(RegistryError::UnknownInstance { pid })?;
        instance.transition(InstanceState::Busy)?;
        instance.busy_since = Some(now);
        Ok(())
    }

    /// A busy instance replied at `now`; it becomes idle and its timings are recorded.
    pub fn release(
        &mut self,
        pid: Pid,
        now: Instant,
        resource_time: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let instance = self
            .instance_mut(pid)
            .ok_or(RegistryError::UnknownInstance { pid })?;
        if let Some(since) = instance.busy_since {
            instance.statistics.roundtrip.time(since, now);
        }
        if let Some(elapsed) = resource_time {
            instance.statistics.resource.record(elapsed);
        }
        instance.transition(InstanceState::Idle)?;
        Ok(())
    }

    /// Forget an instance whose process is gone; its statistics stay with the proxy.
    pub fn instance_removed(&mut self, pid: Pid) -> Option<Instance> {
        self.proxies
            .iter_mut()
            .find_map(|proxy| proxy.remove_instance(pid))
    }

    pub fn instance(&self, pid: Pid) -> Option<&Instance> {
        self.proxies
            .iter()
            .flat_map(|p| p.instances.iter())
            .find(|i| i.process.pid == pid)
    }

    pub fn instance_mut(&mut self, pid: Pid) -> Option<&mut Instance> {
        self.proxies
            .iter_mut()
            .flat_map(|p| p.instances.iter_mut())
            .find(|i| i.process.pid == pid)
    }

    pub fn idle_instances(&self, id: ResourceId) -> impl Iterator<Item = &Instance> {
        self.proxy(id)
            .into_iter()
            .flat_map(|p| p.instances.iter())
            .filter(|i| i.state == InstanceState::Idle)
    }

    pub fn first_idle(&self, id: ResourceId) -> Option<ProcessHandle> {
        self.idle_instances(id).next().map(|i| i.process)
    }

    pub fn booted(&self) -> bool {
        self.proxies.iter().all(Proxy::booted)
    }

    /// Change the configured concurrency of a proxy.
    ///
    /// When scaling down, surplus idle instances are marked shutdown and
    /// returned so whoever manages processes can stop them.
    pub fn scale(
        &mut self,
        id: ResourceId,
        instances: usize,
    ) -> Result<Vec<ProcessHandle>, RegistryError> {
        let proxy = self
            .proxy_mut(id)
            .ok_or(RegistryError::UnknownResource { id })?;
        let previous = proxy.concurrency;
        proxy.concurrency = instances;

        let live = proxy
            .instances
            .iter()
            .filter(|i| !matches!(i.state, InstanceState::Shutdown | InstanceState::Error))
            .count();
        let mut surplus = live.saturating_sub(instances);
        let mut stopping = Vec::new();
        for instance in proxy.instances.iter_mut().rev() {
            if surplus == 0 {
                break;
            }
            if instance.state == InstanceState::Idle {
                instance.state = InstanceState::Shutdown;
                stopping.push(instance.process);
                surplus -= 1;
            }
        }
        tracing::info!(resource = %id, from = previous, to = instances, stopping = stopping.len(), "scaled resource proxy");
        Ok(stopping)
    }
}

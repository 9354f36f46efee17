#![allow(dead_code)]

//! A coordinator wired to in-memory queues, with hand-driven resource
//! instances and one caller.

use std::time::{Duration, Instant};

use tmbus::core::{Correlation, Pid, ProcessHandle, ResourceId, Trid, XaCode};
use tmbus::tm::message::{CallerRequest, Involved, ResourceConnect, ResourceReply};
use tmbus::tm::{
    LogError, LogRow, Manager, ManagerError, ProxyConfig, Registry, TmMessage, TransactionLog,
};
use tmbus::tm::log::BeginMeta;
use tmbus::transport::{InboundDevice, MemoryNamespace, MemoryReader, OutboundDevice, Policy};
use tmbus::Limits;

pub const FRAME_BYTES: usize = 256;
pub const QUEUE_CAPACITY: usize = 64;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A process with its own inbound queue.
pub struct Endpoint {
    pub process: ProcessHandle,
    pub inbound: InboundDevice<MemoryReader>,
}

impl Endpoint {
    pub fn new(namespace: &MemoryNamespace, pid: u32) -> Self {
        let (queue, reader) = namespace.create().expect("create queue");
        Self {
            process: ProcessHandle::new(Pid::new(pid), queue),
            inbound: InboundDevice::new(reader, &Limits::default()),
        }
    }

    /// Next message already queued, if any.
    pub fn try_recv(&mut self) -> Option<(TmMessage, Correlation)> {
        self.recv_with(Policy::NonBlocking)
    }

    /// Next message, waiting a little for it.
    pub fn recv(&mut self) -> (TmMessage, Correlation) {
        self.recv_with(Policy::Timeout(RECV_TIMEOUT))
            .expect("message within timeout")
    }

    pub fn recv_within(&mut self, timeout: Duration) -> Option<(TmMessage, Correlation)> {
        self.recv_with(Policy::Timeout(timeout))
    }

    fn recv_with(&mut self, policy: Policy) -> Option<(TmMessage, Correlation)> {
        let message = self.inbound.next(policy).expect("receive")?;
        let decoded = TmMessage::from_complete(&message).expect("decode");
        Some((decoded, message.correlation()))
    }
}

/// Sends to the coordinator's inbound queue.
pub struct Sender {
    device: OutboundDevice<tmbus::transport::MemoryWriter>,
}

impl Sender {
    pub fn new(namespace: &MemoryNamespace, target: ProcessHandle) -> Self {
        let writer = namespace.writer(target.queue).expect("tm writer");
        Self {
            device: OutboundDevice::new(writer),
        }
    }

    pub fn send(&mut self, message: &TmMessage) -> Correlation {
        let correlation = Correlation::new();
        self.send_with(message, correlation);
        correlation
    }

    pub fn send_with(&mut self, message: &TmMessage, correlation: Correlation) {
        let complete = message.to_complete(correlation).expect("encode");
        self.device
            .put_message(complete, Policy::Blocking)
            .expect("send to tm");
    }
}

pub fn resource(raw: i32) -> ResourceId {
    ResourceId::new(raw).expect("resource id")
}

pub fn proxy_config(id: ResourceId, instances: usize) -> ProxyConfig {
    ProxyConfig {
        id,
        name: format!("rm{id}"),
        key: "test".into(),
        openinfo: String::new(),
        closeinfo: String::new(),
        instances,
        note: String::new(),
    }
}

pub fn involved(trid: Trid, caller: ProcessHandle, resources: &[ResourceId]) -> TmMessage {
    TmMessage::Involved(Involved {
        trid,
        process: caller,
        resources: resources.to_vec(),
        timeout_ms: None,
        owner: None,
    })
}

pub fn commit(trid: Trid, caller: ProcessHandle) -> TmMessage {
    TmMessage::Commit(CallerRequest {
        trid,
        process: caller,
    })
}

pub fn rollback(trid: Trid, caller: ProcessHandle) -> TmMessage {
    TmMessage::Rollback(CallerRequest {
        trid,
        process: caller,
    })
}

/// The reply an instance sends for `request`.
pub fn answer(request: &TmMessage, instance: ProcessHandle, state: XaCode) -> TmMessage {
    let body = match request {
        TmMessage::Prepare(body)
        | TmMessage::ResourceCommit(body)
        | TmMessage::ResourceRollback(body) => body,
        other => panic!("not a resource request: {other:?}"),
    };
    let reply = ResourceReply {
        trid: body.trid,
        resource: body.resource,
        process: instance,
        state,
        elapsed_us: Some(150),
    };
    match request {
        TmMessage::Prepare(_) => TmMessage::PrepareReply(reply),
        TmMessage::ResourceCommit(_) => TmMessage::ResourceCommitReply(reply),
        _ => TmMessage::ResourceRollbackReply(reply),
    }
}

/// Coordinator driven synchronously: every delivery is handled and flushed
/// on the test thread.
pub struct Harness<L> {
    pub namespace: MemoryNamespace,
    pub manager: Manager<L, MemoryNamespace>,
    pub caller: Endpoint,
    /// Instances per resource, in registry order.
    pub instances: Vec<(ResourceId, Vec<Endpoint>)>,
    tm_reader: InboundDevice<MemoryReader>,
}

impl<L: TransactionLog> Harness<L> {
    /// One proxy per entry of `layout`, with that many connected instances.
    pub fn new(log: L, layout: &[usize]) -> Self {
        let namespace = MemoryNamespace::new(QUEUE_CAPACITY, FRAME_BYTES);
        let tm = Endpoint::new(&namespace, 1);
        let caller = Endpoint::new(&namespace, 10);

        let mut registry = Registry::new();
        let mut instances = Vec::new();
        let mut pid = 100;
        for (idx, count) in layout.iter().enumerate() {
            let id = resource(idx as i32 + 1);
            registry.register(proxy_config(id, *count)).expect("register");
            let endpoints = (0..*count)
                .map(|_| {
                    pid += 1;
                    Endpoint::new(&namespace, pid)
                })
                .collect();
            instances.push((id, endpoints));
        }

        let manager = Manager::new(tm.process, registry, log, namespace.clone());
        let mut harness = Self {
            namespace,
            manager,
            caller,
            instances,
            tm_reader: tm.inbound,
        };
        let connects: Vec<_> = harness
            .instances
            .iter()
            .flat_map(|(id, endpoints)| {
                endpoints.iter().map(move |e| {
                    TmMessage::Connect(ResourceConnect {
                        resource: *id,
                        process: e.process,
                    })
                })
            })
            .collect();
        for connect in connects {
            harness.deliver(&connect).expect("connect");
        }
        harness
    }

    /// Handle without flushing; nothing gated on the log is released.
    pub fn handle(&mut self, message: &TmMessage) -> Result<Correlation, ManagerError> {
        let correlation = Correlation::new();
        let complete = message.to_complete(correlation).expect("encode");
        self.manager.handle(complete, Instant::now())?;
        Ok(correlation)
    }

    /// Handle and flush, as one loop turn does.
    pub fn deliver(&mut self, message: &TmMessage) -> Result<Correlation, ManagerError> {
        let correlation = self.handle(message)?;
        self.manager.flush(Instant::now())?;
        Ok(correlation)
    }

    pub fn instance(&mut self, resource: ResourceId, idx: usize) -> &mut Endpoint {
        let (_, endpoints) = self
            .instances
            .iter_mut()
            .find(|(id, _)| *id == resource)
            .expect("resource in layout");
        &mut endpoints[idx]
    }

    /// Take the request queued for an instance and deliver its reply.
    pub fn reply(
        &mut self,
        resource: ResourceId,
        idx: usize,
        state: XaCode,
    ) -> Result<TmMessage, ManagerError> {
        let endpoint = self.instance(resource, idx);
        let process = endpoint.process;
        let (request, _) = endpoint.try_recv().expect("request queued for instance");
        self.deliver(&answer(&request, process, state))?;
        Ok(request)
    }

    /// Messages the coordinator sent to its own queue (none expected).
    pub fn own_queue_is_empty(&mut self) -> bool {
        self.tm_reader
            .next(Policy::NonBlocking)
            .expect("read own queue")
            .is_none()
    }
}

/// Log double whose `persist` waits for a token on `gate`.
pub struct GatedLog<L> {
    pub inner: L,
    pub gate: crossbeam::channel::Receiver<()>,
}

impl<L: TransactionLog> TransactionLog for GatedLog<L> {
    fn begin(&mut self, trid: &Trid, meta: &BeginMeta) -> Result<(), LogError> {
        self.inner.begin(trid, meta)
    }

    fn prepare_commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.inner.prepare_commit(trid)
    }

    fn commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.inner.commit(trid)
    }

    fn rollback(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.inner.rollback(trid)
    }

    fn persist(&mut self) -> Result<(), LogError> {
        // A dropped gate lets everything through.
        let _ = self.gate.recv();
        self.inner.persist()
    }

    fn select(&self, trid: &Trid) -> Result<Vec<LogRow>, LogError> {
        self.inner.select(trid)
    }

    fn select_all(&self) -> Result<Vec<LogRow>, LogError> {
        self.inner.select_all()
    }
}

//! Transaction manager protocol messages and their CBOR bodies.
//!
//! Each message travels as one logical transport message: the transport
//! message type selects the variant and the payload is a CBOR map.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Correlation, Pid, ProcessHandle, QueueId, ResourceId, Trid, XaCode};
use crate::transport::{CompleteMessage, MessageType};

pub mod kind {
    use crate::transport::MessageType;

    pub const INVOLVED: MessageType = MessageType::new(4001);
    pub const COMMIT_REQUEST: MessageType = MessageType::new(4002);
    pub const COMMIT_REPLY: MessageType = MessageType::new(4003);
    pub const ROLLBACK_REQUEST: MessageType = MessageType::new(4004);
    pub const ROLLBACK_REPLY: MessageType = MessageType::new(4005);
    pub const EXTERNAL_INVOLVED: MessageType = MessageType::new(4006);

    pub const PREPARE_REQUEST: MessageType = MessageType::new(4101);
    pub const PREPARE_REPLY: MessageType = MessageType::new(4102);
    pub const RESOURCE_COMMIT_REQUEST: MessageType = MessageType::new(4103);
    pub const RESOURCE_COMMIT_REPLY: MessageType = MessageType::new(4104);
    pub const RESOURCE_ROLLBACK_REQUEST: MessageType = MessageType::new(4105);
    pub const RESOURCE_ROLLBACK_REPLY: MessageType = MessageType::new(4106);
    pub const RESOURCE_CONNECT: MessageType = MessageType::new(4201);

    pub const PROCESS_EXIT: MessageType = MessageType::new(4301);
    pub const SHUTDOWN: MessageType = MessageType::new(4302);
}

const MAX_MAP_ENTRIES: u64 = 32;
const MAX_RESOURCES: u64 = 1024;

/// A caller enlists resources in a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Involved {
    pub trid: Trid,
    pub process: ProcessHandle,
    pub resources: Vec<ResourceId>,
    pub timeout_ms: Option<u64>,
    /// External proxy owning the transaction when it was begun in another domain.
    pub owner: Option<ResourceId>,
}

/// Commit or rollback asked by the transaction's caller, or a gateway
/// enlisting itself as an external resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerRequest {
    pub trid: Trid,
    pub process: ProcessHandle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerReply {
    pub trid: Trid,
    pub state: XaCode,
}

/// Prepare, commit or rollback sent to one resource proxy instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub trid: Trid,
    pub resource: ResourceId,
    /// Where the reply goes.
    pub process: ProcessHandle,
    pub flags: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceReply {
    pub trid: Trid,
    pub resource: ResourceId,
    /// The instance that handled the request.
    pub process: ProcessHandle,
    pub state: XaCode,
    /// Time the instance spent in the resource manager call.
    pub elapsed_us: Option<u64>,
}

/// A resource proxy instance announces it is ready.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceConnect {
    pub resource: ResourceId,
    pub process: ProcessHandle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TmMessage {
    Involved(Involved),
    ExternalInvolved(CallerRequest),
    Commit(CallerRequest),
    Rollback(CallerRequest),
    CommitReply(CallerReply),
    RollbackReply(CallerReply),
    Prepare(ResourceRequest),
    ResourceCommit(ResourceRequest),
    ResourceRollback(ResourceRequest),
    PrepareReply(ResourceReply),
    ResourceCommitReply(ResourceReply),
    ResourceRollbackReply(ResourceReply),
    Connect(ResourceConnect),
    ProcessExit(Pid),
    Shutdown,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(MessageType),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

impl TmMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            TmMessage::Involved(_) => kind::INVOLVED,
            TmMessage::ExternalInvolved(_) => kind::EXTERNAL_INVOLVED,
            TmMessage::Commit(_) => kind::COMMIT_REQUEST,
            TmMessage::Rollback(_) => kind::ROLLBACK_REQUEST,
            TmMessage::CommitReply(_) => kind::COMMIT_REPLY,
            TmMessage::RollbackReply(_) => kind::ROLLBACK_REPLY,
            TmMessage::Prepare(_) => kind::PREPARE_REQUEST,
            TmMessage::ResourceCommit(_) => kind::RESOURCE_COMMIT_REQUEST,
            TmMessage::ResourceRollback(_) => kind::RESOURCE_ROLLBACK_REQUEST,
            TmMessage::PrepareReply(_) => kind::PREPARE_REPLY,
            TmMessage::ResourceCommitReply(_) => kind::RESOURCE_COMMIT_REPLY,
            TmMessage::ResourceRollbackReply(_) => kind::RESOURCE_ROLLBACK_REPLY,
            TmMessage::Connect(_) => kind::RESOURCE_CONNECT,
            TmMessage::ProcessExit(_) => kind::PROCESS_EXIT,
            TmMessage::Shutdown => kind::SHUTDOWN,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>, ProtoEncodeError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        match self {
            TmMessage::Involved(msg) => encode_involved(&mut enc, msg)?,
            TmMessage::ExternalInvolved(msg) | TmMessage::Commit(msg) | TmMessage::Rollback(msg) => {
                encode_caller_request(&mut enc, msg)?
            }
            TmMessage::CommitReply(msg) | TmMessage::RollbackReply(msg) => {
                encode_caller_reply(&mut enc, msg)?
            }
            TmMessage::Prepare(msg)
            | TmMessage::ResourceCommit(msg)
            | TmMessage::ResourceRollback(msg) => encode_resource_request(&mut enc, msg)?,
            TmMessage::PrepareReply(msg)
            | TmMessage::ResourceCommitReply(msg)
            | TmMessage::ResourceRollbackReply(msg) => encode_resource_reply(&mut enc, msg)?,
            TmMessage::Connect(msg) => encode_connect(&mut enc, msg)?,
            TmMessage::ProcessExit(pid) => {
                enc.map(1)?;
                enc.str("pid")?;
                enc.u32(pid.get())?;
            }
            TmMessage::Shutdown => {
                enc.map(0)?;
            }
        }
        Ok(buf)
    }

    pub fn to_complete(&self, correlation: Correlation) -> Result<CompleteMessage, ProtoEncodeError> {
        Ok(CompleteMessage::new(
            self.message_type(),
            correlation,
            Bytes::from(self.encode_body()?),
        ))
    }

    pub fn decode(message_type: MessageType, bytes: &[u8]) -> Result<Self, ProtoDecodeError> {
        let mut dec = Decoder::new(bytes);
        let message = match message_type {
            kind::INVOLVED => TmMessage::Involved(decode_involved(&mut dec)?),
            kind::EXTERNAL_INVOLVED => {
                TmMessage::ExternalInvolved(decode_caller_request(&mut dec)?)
            }
            kind::COMMIT_REQUEST => TmMessage::Commit(decode_caller_request(&mut dec)?),
            kind::ROLLBACK_REQUEST => TmMessage::Rollback(decode_caller_request(&mut dec)?),
            kind::COMMIT_REPLY => TmMessage::CommitReply(decode_caller_reply(&mut dec)?),
            kind::ROLLBACK_REPLY => TmMessage::RollbackReply(decode_caller_reply(&mut dec)?),
            kind::PREPARE_REQUEST => TmMessage::Prepare(decode_resource_request(&mut dec)?),
            kind::RESOURCE_COMMIT_REQUEST => {
                TmMessage::ResourceCommit(decode_resource_request(&mut dec)?)
            }
            kind::RESOURCE_ROLLBACK_REQUEST => {
                TmMessage::ResourceRollback(decode_resource_request(&mut dec)?)
            }
            kind::PREPARE_REPLY => TmMessage::PrepareReply(decode_resource_reply(&mut dec)?),
            kind::RESOURCE_COMMIT_REPLY => {
                TmMessage::ResourceCommitReply(decode_resource_reply(&mut dec)?)
            }
            kind::RESOURCE_ROLLBACK_REPLY => {
                TmMessage::ResourceRollbackReply(decode_resource_reply(&mut dec)?)
            }
            kind::RESOURCE_CONNECT => TmMessage::Connect(decode_connect(&mut dec)?),
            kind::PROCESS_EXIT => TmMessage::ProcessExit(decode_process_exit(&mut dec)?),
            kind::SHUTDOWN => {
                let len = decode_map_len(&mut dec)?;
                for _ in 0..len {
                    decode_text(&mut dec)?;
                    skip_value(&mut dec)?;
                }
                TmMessage::Shutdown
            }
            other => return Err(ProtoDecodeError::UnknownMessageType(other)),
        };
        if dec.datatype().is_ok() {
            return Err(ProtoDecodeError::TrailingBytes);
        }
        Ok(message)
    }

    pub fn from_complete(message: &CompleteMessage) -> Result<Self, ProtoDecodeError> {
        Self::decode(message.message_type(), message.payload())
    }
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

fn encode_trid(enc: &mut Enc<'_>, trid: &Trid) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("format")?;
    enc.i32(trid.format())?;
    enc.str("global")?;
    enc.bytes(trid.global().as_bytes())?;
    enc.str("branch")?;
    enc.bytes(trid.branch_id().as_bytes())?;
    Ok(())
}

fn encode_process(enc: &mut Enc<'_>, process: &ProcessHandle) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("pid")?;
    enc.u32(process.pid.get())?;
    enc.str("queue")?;
    enc.u64(process.queue.get())?;
    Ok(())
}

fn encode_involved(enc: &mut Enc<'_>, msg: &Involved) -> Result<(), ProtoEncodeError> {
    let mut len = 3;
    if msg.timeout_ms.is_some() {
        len += 1;
    }
    if msg.owner.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("trid")?;
    encode_trid(enc, &msg.trid)?;
    enc.str("process")?;
    encode_process(enc, &msg.process)?;
    enc.str("resources")?;
    enc.array(msg.resources.len() as u64)?;
    for id in &msg.resources {
        enc.i32(id.get())?;
    }
    if let Some(timeout_ms) = msg.timeout_ms {
        enc.str("timeout_ms")?;
        enc.u64(timeout_ms)?;
    }
    if let Some(owner) = msg.owner {
        enc.str("owner")?;
        enc.i32(owner.get())?;
    }
    Ok(())
}

fn encode_caller_request(enc: &mut Enc<'_>, msg: &CallerRequest) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("trid")?;
    encode_trid(enc, &msg.trid)?;
    enc.str("process")?;
    encode_process(enc, &msg.process)?;
    Ok(())
}

fn encode_caller_reply(enc: &mut Enc<'_>, msg: &CallerReply) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("trid")?;
    encode_trid(enc, &msg.trid)?;
    enc.str("state")?;
    enc.i32(msg.state.raw())?;
    Ok(())
}

fn encode_resource_request(
    enc: &mut Enc<'_>,
    msg: &ResourceRequest,
) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("trid")?;
    encode_trid(enc, &msg.trid)?;
    enc.str("resource")?;
    enc.i32(msg.resource.get())?;
    enc.str("process")?;
    encode_process(enc, &msg.process)?;
    enc.str("flags")?;
    enc.i64(msg.flags)?;
    Ok(())
}

fn encode_resource_reply(enc: &mut Enc<'_>, msg: &ResourceReply) -> Result<(), ProtoEncodeError> {
    enc.map(if msg.elapsed_us.is_some() { 5 } else { 4 })?;
    enc.str("trid")?;
    encode_trid(enc, &msg.trid)?;
    enc.str("resource")?;
    enc.i32(msg.resource.get())?;
    enc.str("process")?;
    encode_process(enc, &msg.process)?;
    enc.str("state")?;
    enc.i32(msg.state.raw())?;
    if let Some(elapsed_us) = msg.elapsed_us {
        enc.str("elapsed_us")?;
        enc.u64(elapsed_us)?;
    }
    Ok(())
}

fn encode_connect(enc: &mut Enc<'_>, msg: &ResourceConnect) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("resource")?;
    enc.i32(msg.resource.get())?;
    enc.str("process")?;
    encode_process(enc, &msg.process)?;
    Ok(())
}

fn decode_involved(dec: &mut Decoder) -> Result<Involved, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut trid = None;
    let mut process = None;
    let mut resources = None;
    let mut timeout_ms = None;
    let mut owner = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "trid" => trid = Some(decode_trid(dec)?),
            "process" => process = Some(decode_process(dec)?),
            "resources" => {
                let count = decode_array_len(dec, MAX_RESOURCES, "resources")?;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(decode_resource_id(dec, "resources")?);
                }
                resources = Some(ids);
            }
            "timeout_ms" => timeout_ms = Some(dec.u64()?),
            "owner" => owner = Some(decode_resource_id(dec, "owner")?),
            _ => skip_value(dec)?,
        }
    }
    Ok(Involved {
        trid: trid.ok_or(ProtoDecodeError::MissingField("trid"))?,
        process: process.ok_or(ProtoDecodeError::MissingField("process"))?,
        resources: resources.ok_or(ProtoDecodeError::MissingField("resources"))?,
        timeout_ms,
        owner,
    })
}

fn decode_caller_request(dec: &mut Decoder) -> Result<CallerRequest, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut trid = None;
    let mut process = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "trid" => trid = Some(decode_trid(dec)?),
            "process" => process = Some(decode_process(dec)?),
            _ => skip_value(dec)?,
        }
    }
    Ok(CallerRequest {
        trid: trid.ok_or(ProtoDecodeError::MissingField("trid"))?,
        process: process.ok_or(ProtoDecodeError::MissingField("process"))?,
    })
}

fn decode_caller_reply(dec: &mut Decoder) -> Result<CallerReply, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut trid = None;
    let mut state = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "trid" => trid = Some(decode_trid(dec)?),
            "state" => state = Some(decode_xa(dec)?),
            _ => skip_value(dec)?,
        }
    }
    Ok(CallerReply {
        trid: trid.ok_or(ProtoDecodeError::MissingField("trid"))?,
        state: state.ok_or(ProtoDecodeError::MissingField("state"))?,
    })
}

fn decode_resource_request(dec: &mut Decoder) -> Result<ResourceRequest, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut trid = None;
    let mut resource = None;
    let mut process = None;
    let mut flags = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "trid" => trid = Some(decode_trid(dec)?),
            "resource" => resource = Some(decode_resource_id(dec, "resource")?),
            "process" => process = Some(decode_process(dec)?),
            "flags" => flags = Some(dec.i64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(ResourceRequest {
        trid: trid.ok_or(ProtoDecodeError::MissingField("trid"))?,
        resource: resource.ok_or(ProtoDecodeError::MissingField("resource"))?,
        process: process.ok_or(ProtoDecodeError::MissingField("process"))?,
        flags: flags.unwrap_or(0),
    })
}

fn decode_resource_reply(dec: &mut Decoder) -> Result<ResourceReply, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut trid = None;
    let mut resource = None;
    let mut process = None;
    let mut state = None;
    let mut elapsed_us = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "trid" => trid = Some(decode_trid(dec)?),
            "resource" => resource = Some(decode_resource_id(dec, "resource")?),
            "process" => process = Some(decode_process(dec)?),
            "state" => state = Some(decode_xa(dec)?),
            "elapsed_us" => elapsed_us = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(ResourceReply {
        trid: trid.ok_or(ProtoDecodeError::MissingField("trid"))?,
        resource: resource.ok_or(ProtoDecodeError::MissingField("resource"))?,
        process: process.ok_or(ProtoDecodeError::MissingField("process"))?,
        state: state.ok_or(ProtoDecodeError::MissingField("state"))?,
        elapsed_us,
    })
}

fn decode_connect(dec: &mut Decoder) -> Result<ResourceConnect, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut resource = None;
    let mut process = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "resource" => resource = Some(decode_resource_id(dec, "resource")?),
            "process" => process = Some(decode_process(dec)?),
            _ => skip_value(dec)?,
        }
    }
    Ok(ResourceConnect {
        resource: resource.ok_or(ProtoDecodeError::MissingField("resource"))?,
        process: process.ok_or(ProtoDecodeError::MissingField("process"))?,
    })
}

fn decode_process_exit(dec: &mut Decoder) -> Result<Pid, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut pid = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "pid" => pid = Some(Pid::new(dec.u32()?)),
            _ => skip_value(dec)?,
        }
    }
    pid.ok_or(ProtoDecodeError::MissingField("pid"))
}

fn decode_trid(dec: &mut Decoder) -> Result<Trid, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut format = None;
    let mut global = None;
    let mut branch = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "format" => format = Some(dec.i32()?),
            "global" => global = Some(decode_uuid(dec, "trid.global")?),
            "branch" => branch = Some(decode_uuid(dec, "trid.branch")?),
            _ => skip_value(dec)?,
        }
    }
    let format = format.ok_or(ProtoDecodeError::MissingField("trid.format"))?;
    let global = global.ok_or(ProtoDecodeError::MissingField("trid.global"))?;
    let branch = branch.ok_or(ProtoDecodeError::MissingField("trid.branch"))?;
    Trid::new(format, global, branch).map_err(|err| ProtoDecodeError::InvalidField {
        field: "trid",
        reason: err.to_string(),
    })
}

fn decode_process(dec: &mut Decoder) -> Result<ProcessHandle, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut pid = None;
    let mut queue = None;
    for _ in 0..len {
        match decode_text(dec)? {
            "pid" => pid = Some(Pid::new(dec.u32()?)),
            "queue" => queue = Some(QueueId::new(dec.u64()?)),
            _ => skip_value(dec)?,
        }
    }
    Ok(ProcessHandle::new(
        pid.ok_or(ProtoDecodeError::MissingField("process.pid"))?,
        queue.ok_or(ProtoDecodeError::MissingField("process.queue"))?,
    ))
}

fn decode_uuid(dec: &mut Decoder, field: &'static str) -> Result<Uuid, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    Uuid::from_slice(bytes).map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

fn decode_resource_id(
    dec: &mut Decoder,
    field: &'static str,
) -> Result<ResourceId, ProtoDecodeError> {
    let raw = dec.i32()?;
    ResourceId::new(raw).map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

fn decode_xa(dec: &mut Decoder) -> Result<XaCode, ProtoDecodeError> {
    let raw = dec.i32()?;
    XaCode::from_raw(raw).ok_or_else(|| ProtoDecodeError::InvalidField {
        field: "state",
        reason: format!("unknown xa code {raw}"),
    })
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > MAX_MAP_ENTRIES {
        return Err(ProtoDecodeError::DecodeLimit("max_map_entries"));
    }
    Ok(len)
}

fn decode_array_len(
    dec: &mut Decoder,
    max: u64,
    field: &'static str,
) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.array()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > max {
        return Err(ProtoDecodeError::DecodeLimit(field));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit(field))
}

fn decode_text<'a>(dec: &mut Decoder<'a>) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    Ok(dec.str()?)
}

fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::ArrayIndef | Type::MapIndef | Type::BytesIndef | Type::StringIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

//! In-process transport
//!
//! Requests are framed with [`CollocatedCodec`] and dispatched straight
//! into a [`Dispatcher`] registered under an endpoint name. Deferred
//! requests run on a worker thread and answer through a oneshot channel.
//!
//! Request frame:
//!
//! ```text
//! flags (1) | key len (4) | key | operation len (4) | operation | args (rest)
//! ```
//!
//! Reply frame:
//!
//! ```text
//! 0 | body                                         no exception
//! 1 | id len (4) | id | body                       user exception
//! 2 | kind (1) | completion (1) | len (4) | detail  system exception
//! 3 | permanent (1) | reference                    location forward
//! ```
//!
//! Fields longer than `u32::MAX` bytes are rejected with
//! [`OrbError::Marshal`].

use std::collections::HashMap;
use std::sync::Arc;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, trace};

use super::transport::{
    Connector, Marshaler, OutgoingRequest, PendingReply, ReplyStatus, Transport, TransportError,
    TransportResult,
};
use crate::dispatch::{Dispatcher, UpcallOutcome};
use crate::types::{CompletionStatus, ObjectKey, ObjectRef, OrbError, Result};

const FLAG_RESPONSE_EXPECTED: u8 = 0x01;

const REPLY_NO_EXCEPTION: u8 = 0;
const REPLY_USER_EXCEPTION: u8 = 1;
const REPLY_SYSTEM_EXCEPTION: u8 = 2;
const REPLY_LOCATION_FORWARD: u8 = 3;

const SYSTEM_UNKNOWN: u8 = 0;
const SYSTEM_TRANSIENT: u8 = 1;
const SYSTEM_COMM_FAILURE: u8 = 2;
const SYSTEM_OBJECT_NOT_EXIST: u8 = 3;
const SYSTEM_ADAPTER_INACTIVE: u8 = 4;

/// A decoded request frame
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub key: ObjectKey,
    pub operation: String,
    pub args: Bytes,
    pub response_expected: bool,
}

/// Frame codec shared by both ends of the collocated transport
#[derive(Debug, Clone, Copy, Default)]
pub struct CollocatedCodec;

impl CollocatedCodec {
    pub fn encode_request(&self, request: &OutgoingRequest) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            9 + request.key.len() + request.operation.len() + request.args.len(),
        );
        buf.put_u8(if request.response_expected {
            FLAG_RESPONSE_EXPECTED
        } else {
            0
        });
        put_bytes(&mut buf, request.key.as_bytes())?;
        put_bytes(&mut buf, request.operation.as_bytes())?;
        buf.put_slice(&request.args);
        Ok(buf.freeze())
    }

    pub fn decode_request(&self, mut frame: Bytes) -> Result<IncomingRequest> {
        need(&frame, 1)?;
        let flags = frame.get_u8();
        let key = ObjectKey::new(get_bytes(&mut frame)?);
        let operation = get_string(&mut frame)?;
        Ok(IncomingRequest {
            key,
            operation,
            args: frame,
            response_expected: flags & FLAG_RESPONSE_EXPECTED != 0,
        })
    }

    /// Encode the outcome of a dispatch
    ///
    /// Dispatch errors travel as system exceptions.
    pub fn encode_reply(&self, outcome: &Result<UpcallOutcome>) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match outcome {
            Ok(UpcallOutcome::Reply(body)) => {
                buf.put_u8(REPLY_NO_EXCEPTION);
                buf.put_slice(body);
            }
            Ok(UpcallOutcome::UserException { id, body }) => {
                buf.put_u8(REPLY_USER_EXCEPTION);
                put_bytes(&mut buf, id.as_bytes())?;
                buf.put_slice(body);
            }
            Ok(UpcallOutcome::LocationForward { target, permanent }) => {
                buf.put_u8(REPLY_LOCATION_FORWARD);
                buf.put_u8(u8::from(*permanent));
                put_bytes(&mut buf, target.type_id.as_bytes())?;
                put_bytes(&mut buf, target.endpoint.as_bytes())?;
                put_bytes(&mut buf, target.key.as_bytes())?;
            }
            Err(err) => {
                buf.put_u8(REPLY_SYSTEM_EXCEPTION);
                let (kind, detail): (u8, Bytes) = match err {
                    OrbError::Transient { reason, .. } => (SYSTEM_TRANSIENT, reason.clone().into()),
                    OrbError::CommFailure { reason, .. } => {
                        (SYSTEM_COMM_FAILURE, reason.clone().into())
                    }
                    OrbError::ObjectNotExist(key) => (SYSTEM_OBJECT_NOT_EXIST, key.to_bytes()),
                    OrbError::AdapterInactive => (SYSTEM_ADAPTER_INACTIVE, Bytes::new()),
                    other => (SYSTEM_UNKNOWN, other.to_string().into()),
                };
                buf.put_u8(kind);
                buf.put_u8(completion_to_wire(err.completion().unwrap_or(CompletionStatus::Maybe)));
                put_bytes(&mut buf, &detail)?;
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode_reply(&self, mut frame: Bytes) -> Result<ReplyStatus> {
        need(&frame, 1)?;
        match frame.get_u8() {
            REPLY_NO_EXCEPTION => Ok(ReplyStatus::NoException(frame)),
            REPLY_USER_EXCEPTION => {
                let id = get_string(&mut frame)?;
                Ok(ReplyStatus::UserException { id, body: frame })
            }
            REPLY_SYSTEM_EXCEPTION => {
                need(&frame, 2)?;
                let kind = frame.get_u8();
                let completion = completion_from_wire(frame.get_u8())?;
                let detail = get_bytes(&mut frame)?;
                let text = || String::from_utf8_lossy(&detail).into_owned();
                let err = match kind {
                    SYSTEM_TRANSIENT => OrbError::Transient {
                        reason: text(),
                        completion,
                    },
                    SYSTEM_COMM_FAILURE => OrbError::CommFailure {
                        reason: text(),
                        completion,
                    },
                    SYSTEM_OBJECT_NOT_EXIST => OrbError::ObjectNotExist(ObjectKey::new(detail.clone())),
                    SYSTEM_ADAPTER_INACTIVE => OrbError::AdapterInactive,
                    _ => OrbError::Unknown(text()),
                };
                Ok(ReplyStatus::SystemException(err))
            }
            REPLY_LOCATION_FORWARD => {
                need(&frame, 1)?;
                let permanent = frame.get_u8() != 0;
                let type_id = get_string(&mut frame)?;
                let endpoint = get_string(&mut frame)?;
                let key = ObjectKey::new(get_bytes(&mut frame)?);
                Ok(ReplyStatus::LocationForward {
                    target: ObjectRef::new(type_id, endpoint, key),
                    permanent,
                })
            }
            tag => Err(OrbError::Marshal(format!("unknown reply tag {}", tag))),
        }
    }
}

impl Marshaler for CollocatedCodec {
    fn encode(&self, request: &OutgoingRequest) -> Result<Bytes> {
        self.encode_request(request)
    }

    fn decode(&self, reply: Bytes) -> Result<ReplyStatus> {
        self.decode_reply(reply)
    }
}

/// Transport that dispatches into a local [`Dispatcher`]
pub struct CollocatedTransport {
    dispatcher: Arc<Dispatcher>,
    codec: CollocatedCodec,
}

impl CollocatedTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            codec: CollocatedCodec,
        }
    }

    fn serve(dispatcher: &Dispatcher, codec: CollocatedCodec, frame: Bytes) -> TransportResult<Bytes> {
        let request = codec.decode_request(frame).map_err(TransportError::Permanent)?;
        trace!("collocated {} on {}", request.operation, request.key);
        let outcome = dispatcher.dispatch(&request.key, &request.operation, request.args);
        codec
            .encode_reply(&outcome)
            .or_else(|err| codec.encode_reply(&Err(err)))
            .map_err(TransportError::Permanent)
    }
}

impl Transport for CollocatedTransport {
    fn request(&self, request: Bytes) -> TransportResult<Bytes> {
        Self::serve(&self.dispatcher, self.codec, request)
    }

    fn oneway(&self, request: Bytes) -> TransportResult<()> {
        let request = self.codec.decode_request(request).map_err(TransportError::Permanent)?;
        if let Err(err) = self
            .dispatcher
            .dispatch(&request.key, &request.operation, request.args)
        {
            debug!("oneway {} failed: {}", request.operation, err);
        }
        Ok(())
    }

    fn deferred(&self, request: Bytes) -> TransportResult<Box<dyn PendingReply>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let dispatcher = Arc::clone(&self.dispatcher);
        let codec = self.codec;
        std::thread::Builder::new()
            .name("orb-deferred".to_string())
            .spawn(move || {
                // The receiver may have been dropped with its invocation
                let _ = reply_tx.send(Self::serve(&dispatcher, codec, request));
            })
            .map_err(|e| {
                TransportError::Transient(OrbError::transient(format!(
                    "cannot start deferred worker: {}",
                    e
                )))
            })?;
        Ok(Box::new(CollocatedReply { receiver: reply_rx }))
    }
}

/// Reply of a deferred collocated request
///
/// `wait` blocks the calling thread and must not be used from inside an
/// async task.
struct CollocatedReply {
    receiver: oneshot::Receiver<TransportResult<Bytes>>,
}

impl PendingReply for CollocatedReply {
    fn poll(&mut self) -> Option<TransportResult<Bytes>> {
        match self.receiver.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(worker_lost())),
        }
    }

    fn wait(self: Box<Self>) -> TransportResult<Bytes> {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(worker_lost()))
    }
}

fn worker_lost() -> TransportError {
    TransportError::Permanent(OrbError::comm_failure(
        "deferred worker exited without replying",
        CompletionStatus::Maybe,
    ))
}

/// Connector resolving endpoint names to in-process dispatchers
#[derive(Default)]
pub struct CollocatedConnector {
    endpoints: RwLock<HashMap<String, Arc<CollocatedTransport>>>,
}

impl CollocatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `endpoint` with `dispatcher`
    pub fn register(&self, endpoint: impl Into<String>, dispatcher: Arc<Dispatcher>) {
        let endpoint = endpoint.into();
        debug!("registering collocated endpoint {}", endpoint);
        self.endpoints
            .write()
            .insert(endpoint, Arc::new(CollocatedTransport::new(dispatcher)));
    }

    pub fn unregister(&self, endpoint: &str) -> bool {
        self.endpoints.write().remove(endpoint).is_some()
    }
}

impl Connector for CollocatedConnector {
    fn bind(&self, target: &ObjectRef) -> TransportResult<Arc<dyn Transport>> {
        match self.endpoints.read().get(&target.endpoint) {
            Some(transport) => Ok(Arc::clone(transport) as Arc<dyn Transport>),
            // The server may not have started yet
            None => Err(TransportError::Transient(OrbError::transient(format!(
                "endpoint {} is not reachable",
                target.endpoint
            )))),
        }
    }
}

fn completion_to_wire(completion: CompletionStatus) -> u8 {
    match completion {
        CompletionStatus::No => 0,
        CompletionStatus::Yes => 1,
        CompletionStatus::Maybe => 2,
    }
}

fn completion_from_wire(value: u8) -> Result<CompletionStatus> {
    match value {
        0 => Ok(CompletionStatus::No),
        1 => Ok(CompletionStatus::Yes),
        2 => Ok(CompletionStatus::Maybe),
        other => Err(OrbError::Marshal(format!("invalid completion status {}", other))),
    }
}

fn need(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(OrbError::Marshal(format!(
            "frame underflow: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| OrbError::Marshal(format!("frame field of {} bytes", bytes.len())))?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|e| OrbError::Marshal(format!("frame string: {}", e)))
}

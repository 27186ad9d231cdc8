//! Scripted connector for invocation unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;

use super::collocated::CollocatedCodec;
use super::transport::{
    Connector, Marshaler, PendingReply, Transport, TransportError, TransportResult,
};
use crate::dispatch::UpcallOutcome;
use crate::types::{ObjectRef, OrbError};

/// What the scripted transport does with one transmission
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Ok(Bytes),
    /// Deferred replies become ready after this many polls
    After(u32, Bytes),
    Transient,
    Fail(OrbError),
    Redirect(ObjectRef, bool),
    User(&'static str),
    /// Deferred sends succeed but the reply fails transiently
    Lost,
    /// Deferred polls meet the barrier twice before answering
    Parked(Arc<Barrier>, Bytes),
}

pub(crate) struct Scripted {
    replies: Mutex<VecDeque<Reply>>,
    repeat: Option<Reply>,
    transmissions: AtomicU32,
    bound: Mutex<Vec<String>>,
    response_expected: AtomicBool,
}

impl Scripted {
    pub(crate) fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            transmissions: AtomicU32::new(0),
            bound: Mutex::new(Vec::new()),
            response_expected: AtomicBool::new(true),
        })
    }

    pub(crate) fn repeating(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply),
            transmissions: AtomicU32::new(0),
            bound: Mutex::new(Vec::new()),
            response_expected: AtomicBool::new(true),
        })
    }

    pub(crate) fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(ScriptedConnector(Arc::clone(self)))
    }

    pub(crate) fn marshaler(&self) -> Arc<dyn Marshaler> {
        Arc::new(CollocatedCodec)
    }

    pub(crate) fn transmissions(&self) -> u32 {
        self.transmissions.load(Ordering::SeqCst)
    }

    pub(crate) fn bound_endpoints(&self) -> Vec<String> {
        self.bound.lock().clone()
    }

    pub(crate) fn last_response_expected(&self) -> bool {
        self.response_expected.load(Ordering::SeqCst)
    }

    fn next(&self, frame: Bytes) -> Reply {
        self.transmissions.fetch_add(1, Ordering::SeqCst);
        if let Ok(request) = CollocatedCodec.decode_request(frame) {
            self.response_expected
                .store(request.response_expected, Ordering::SeqCst);
        }
        self.replies
            .lock()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Reply::Fail(OrbError::Unknown("script exhausted".to_string())))
    }
}

fn encode(outcome: UpcallOutcome) -> TransportResult<Bytes> {
    CollocatedCodec
        .encode_reply(&Ok(outcome))
        .map_err(TransportError::Permanent)
}

fn answer(reply: Reply) -> TransportResult<Bytes> {
    match reply {
        Reply::Ok(body) | Reply::After(_, body) | Reply::Parked(_, body) => {
            encode(UpcallOutcome::Reply(body))
        }
        Reply::User(id) => encode(UpcallOutcome::UserException {
            id: id.to_string(),
            body: Bytes::new(),
        }),
        Reply::Lost => Err(lost()),
        Reply::Transient => Err(TransportError::Transient(OrbError::transient("scripted"))),
        Reply::Fail(err) => Err(TransportError::Permanent(err)),
        Reply::Redirect(target, permanent) => Err(TransportError::Redirect { target, permanent }),
    }
}

struct ScriptedConnector(Arc<Scripted>);

impl Connector for ScriptedConnector {
    fn bind(&self, target: &ObjectRef) -> TransportResult<Arc<dyn Transport>> {
        self.0.bound.lock().push(target.endpoint.clone());
        Ok(Arc::new(ScriptedTransport(Arc::clone(&self.0))))
    }
}

struct ScriptedTransport(Arc<Scripted>);

impl Transport for ScriptedTransport {
    fn request(&self, request: Bytes) -> TransportResult<Bytes> {
        answer(self.0.next(request))
    }

    fn oneway(&self, request: Bytes) -> TransportResult<()> {
        answer(self.0.next(request)).map(|_| ())
    }

    fn deferred(&self, request: Bytes) -> TransportResult<Box<dyn PendingReply>> {
        let reply = self.0.next(request);
        match reply {
            Reply::Lost => Ok(Box::new(Delayed {
                polls_left: 0,
                reply: Some(Err(lost())),
            })),
            Reply::Parked(barrier, body) => Ok(Box::new(Parked {
                barrier,
                reply: Some(answer(Reply::Ok(body))),
            })),
            reply => {
                let polls_left = match reply {
                    Reply::After(polls, _) => polls,
                    _ => 0,
                };
                let reply = answer(reply)?;
                Ok(Box::new(Delayed {
                    polls_left,
                    reply: Some(Ok(reply)),
                }))
            }
        }
    }
}

fn lost() -> TransportError {
    TransportError::Transient(OrbError::transient("scripted reply lost"))
}

fn taken() -> TransportError {
    TransportError::Permanent(OrbError::Unknown("reply taken".into()))
}

struct Delayed {
    polls_left: u32,
    reply: Option<TransportResult<Bytes>>,
}

impl PendingReply for Delayed {
    fn poll(&mut self) -> Option<TransportResult<Bytes>> {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return None;
        }
        self.reply.take()
    }

    fn wait(mut self: Box<Self>) -> TransportResult<Bytes> {
        std::thread::sleep(Duration::from_millis(u64::from(self.polls_left)));
        self.reply.take().unwrap_or_else(|| Err(taken()))
    }
}

/// Reply whose poll blocks until the test releases it
struct Parked {
    barrier: Arc<Barrier>,
    reply: Option<TransportResult<Bytes>>,
}

impl PendingReply for Parked {
    fn poll(&mut self) -> Option<TransportResult<Bytes>> {
        self.barrier.wait();
        self.barrier.wait();
        self.reply.take()
    }

    fn wait(mut self: Box<Self>) -> TransportResult<Bytes> {
        self.reply.take().unwrap_or_else(|| Err(taken()))
    }
}

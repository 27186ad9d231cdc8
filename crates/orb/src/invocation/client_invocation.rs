//! Client side invocation state machine
//!
//! A [`ClientInvocation`] carries one outgoing request from `Unsent` to
//! `Done`. Synchronous and oneway sends complete inline; deferred sends
//! park the reply until [`ClientInvocation::get_response`] or
//! [`ClientInvocation::poll_response`] collects it.
//!
//! ```text
//!   Unsent ──send──> Pending ──transmitted──> Sent ──get_response──> Receiving ──> Done
//!                       │                       │
//!                       │ (sync, oneway)        └──poll found reply──> Received ──get_response──> Done
//!                       └──────────────────────────────────────────────────────────────> Done
//! ```
//!
//! Transient failures are resent under the configured [`RetryPolicy`]
//! and location forwards rebind the transport. Neither moves the visible
//! state. Blocking calls sleep out the retry interval; a poll that hits a
//! transient failure records when the resend is due and returns.
//!
//! [`RetryPolicy`]: super::retry::RetryPolicy

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::pending_set::PendingInvocationSet;
use super::retry::RetryDecision;
use super::transport::{
    Connector, Marshaler, OutgoingRequest, PendingReply, ReplyStatus, Transport, TransportError,
    TransportResult,
};
use crate::config::ClientConfig;
use crate::types::{ObjectRef, OrbError, OrderViolation, Result};

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Externally visible state of an invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvocationState {
    Unsent,
    /// Being marshaled and transmitted, including retries and forwards
    Pending,
    /// Transmitted deferred, reply not yet collected
    Sent,
    /// A caller is blocked collecting the reply
    Receiving,
    /// A poll found the reply; not yet consumed
    Received,
    Done,
}

/// How the invocation was sent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    Sync,
    Oneway,
    Deferred,
}

enum ReplyAction {
    Complete(Result<Bytes>),
    /// Transmit again once the delay has passed
    Resend(Duration),
}

/// What one non-blocking poll step produced
enum Polled {
    Waiting(Box<dyn PendingReply>),
    ResendAt(Instant),
    Ready(Result<Bytes>),
}

struct Progress {
    state: InvocationState,
    mode: Option<InvocationMode>,
    /// A poll is running outside the lock
    polling: bool,
    /// Target after permanent forwards
    base_target: ObjectRef,
    /// Target of the next transmission
    target: ObjectRef,
    binding: Option<Arc<dyn Transport>>,
    pending_reply: Option<Box<dyn PendingReply>>,
    /// A deferred resend is due at this instant
    resend_at: Option<Instant>,
    outcome: Option<Result<Bytes>>,
    attempts: u32,
    forwards: u32,
}

/// One outgoing request
pub struct ClientInvocation {
    id: u64,
    operation: String,
    args: Bytes,
    connector: Arc<dyn Connector>,
    marshaler: Arc<dyn Marshaler>,
    config: ClientConfig,
    progress: Mutex<Progress>,
    changed: Condvar,
    tracker: Mutex<Option<Weak<PendingInvocationSet>>>,
}

impl ClientInvocation {
    /// Create an unsent invocation of `operation` on `target`
    pub fn new(
        target: ObjectRef,
        operation: impl Into<String>,
        args: Bytes,
        connector: Arc<dyn Connector>,
        marshaler: Arc<dyn Marshaler>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            operation: operation.into(),
            args,
            connector,
            marshaler,
            config,
            progress: Mutex::new(Progress {
                state: InvocationState::Unsent,
                mode: None,
                polling: false,
                base_target: target.clone(),
                target,
                binding: None,
                pending_reply: None,
                resend_at: None,
                outcome: None,
                attempts: 0,
                forwards: 0,
            }),
            changed: Condvar::new(),
            tracker: Mutex::new(None),
        })
    }

    /// Process-unique invocation id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Target reference, after any permanent forwards
    pub fn target(&self) -> ObjectRef {
        self.progress.lock().base_target.clone()
    }

    pub fn state(&self) -> InvocationState {
        self.progress.lock().state
    }

    pub fn mode(&self) -> Option<InvocationMode> {
        self.progress.lock().mode
    }

    /// Transmissions made so far, including failed ones
    pub fn attempts(&self) -> u32 {
        self.progress.lock().attempts
    }

    /// Location forwards followed so far
    pub fn forwards(&self) -> u32 {
        self.progress.lock().forwards
    }

    /// Outcome, once the reply has been received
    pub fn result(&self) -> Option<Result<Bytes>> {
        self.progress.lock().outcome.clone()
    }

    /// Register deferred sends of this invocation with `set`
    pub fn track_in(&self, set: &Arc<PendingInvocationSet>) {
        *self.tracker.lock() = Some(Arc::downgrade(set));
    }

    /// Send the request and wait for the reply
    pub fn invoke(&self) -> Result<Bytes> {
        self.start(InvocationMode::Sync)?;
        let outcome = loop {
            match self.transmit(true, |transport, request| transport.request(request)) {
                Ok(reply) => match self.handle_reply(reply) {
                    ReplyAction::Complete(result) => break result,
                    ReplyAction::Resend(delay) => pause(delay),
                },
                Err(err) => break Err(err),
            }
        };
        self.complete(outcome.clone());
        outcome
    }

    /// Send the request without expecting a reply
    pub fn send_oneway(&self) -> Result<()> {
        self.start(InvocationMode::Oneway)?;
        let result = self.transmit(false, |transport, request| transport.oneway(request));
        self.complete(result.clone().map(|()| Bytes::new()));
        result
    }

    /// Send the request and return without waiting
    ///
    /// A transmission failure is not returned here; it becomes the
    /// invocation's outcome and is reported by `get_response`.
    pub fn send_deferred(self: &Arc<Self>) -> Result<()> {
        self.start(InvocationMode::Deferred)?;
        let sent = self.transmit(true, |transport, request| transport.deferred(request));
        {
            let mut progress = self.progress.lock();
            match sent {
                Ok(pending) => {
                    progress.pending_reply = Some(pending);
                    progress.state = InvocationState::Sent;
                }
                Err(err) => {
                    debug!("deferred {} failed to send: {}", self.operation, err);
                    progress.outcome = Some(Err(err));
                    progress.state = InvocationState::Received;
                }
            }
        }
        self.changed.notify_all();

        if let Some(set) = self.tracker() {
            set.add_deferred(Arc::clone(self));
        }
        Ok(())
    }

    /// Block until the reply of a deferred send is available and consume it
    pub fn get_response(&self) -> Result<Bytes> {
        let mut progress = self.progress.lock();
        check_deferred(&progress)?;
        loop {
            if progress.polling {
                self.changed.wait(&mut progress);
                continue;
            }
            match progress.state {
                InvocationState::Receiving => self.changed.wait(&mut progress),
                InvocationState::Unsent | InvocationState::Pending => {
                    return Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent))
                }
                InvocationState::Done => {
                    return Err(OrbError::BadInvOrder(OrderViolation::ResponseAlreadyReceived))
                }
                InvocationState::Received => {
                    progress.state = InvocationState::Done;
                    let outcome = stored_outcome(&progress);
                    drop(progress);
                    self.changed.notify_all();
                    self.untrack();
                    return outcome;
                }
                InvocationState::Sent => {
                    let pending = progress.pending_reply.take();
                    let resend_at = progress.resend_at.take();
                    progress.state = InvocationState::Receiving;
                    drop(progress);

                    let outcome = match (pending, resend_at) {
                        (Some(pending), _) => self.await_reply(pending),
                        (None, Some(at)) => {
                            pause(at.saturating_duration_since(Instant::now()));
                            self.transmit(true, |transport, request| transport.deferred(request))
                                .and_then(|pending| self.await_reply(pending))
                        }
                        (None, None) => Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent)),
                    };
                    self.complete(outcome.clone());
                    self.untrack();
                    return outcome;
                }
            }
        }
    }

    /// Check without blocking whether the reply of a deferred send has arrived
    ///
    /// Returns `false` while another caller is polling. A transient
    /// failure schedules a resend after the retry interval; the first
    /// poll past that point transmits again.
    pub fn poll_response(&self) -> Result<bool> {
        let pending = {
            let mut progress = self.progress.lock();
            check_deferred(&progress)?;
            if progress.polling {
                return Ok(false);
            }
            match progress.state {
                InvocationState::Unsent | InvocationState::Pending => {
                    return Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent))
                }
                InvocationState::Receiving => return Ok(false),
                InvocationState::Received => return Ok(true),
                InvocationState::Done => {
                    return Err(OrbError::BadInvOrder(OrderViolation::ResponseAlreadyReceived))
                }
                InvocationState::Sent => {}
            }
            let pending = match (progress.pending_reply.take(), progress.resend_at) {
                (Some(pending), _) => Some(pending),
                (None, Some(at)) if Instant::now() >= at => {
                    progress.resend_at = None;
                    None
                }
                _ => return Ok(false),
            };
            progress.polling = true;
            pending
        };

        let polled = match pending {
            Some(mut pending) => match pending.poll() {
                None => Polled::Waiting(pending),
                Some(reply) => match self.handle_transport_reply(reply) {
                    ReplyAction::Complete(result) => Polled::Ready(result),
                    ReplyAction::Resend(delay) => Polled::ResendAt(Instant::now() + delay),
                },
            },
            None => self.resend_once(),
        };

        let ready = matches!(polled, Polled::Ready(_));
        {
            let mut progress = self.progress.lock();
            progress.polling = false;
            match polled {
                Polled::Waiting(pending) => progress.pending_reply = Some(pending),
                Polled::ResendAt(at) => progress.resend_at = Some(at),
                Polled::Ready(outcome) => {
                    progress.outcome = Some(outcome);
                    progress.state = InvocationState::Received;
                }
            }
        }
        self.changed.notify_all();
        Ok(ready)
    }

    /// One deferred transmission for a poll; never sleeps
    fn resend_once(&self) -> Polled {
        let failure = match self.attempt(true, &mut |transport: &dyn Transport, request: Bytes| {
            transport.deferred(request)
        }) {
            Ok(pending) => return Polled::Waiting(pending),
            Err(failure) => failure,
        };
        let delay = match failure {
            TransportError::Redirect { target, permanent } => {
                self.follow_forward(target, permanent).map(|()| Duration::ZERO)
            }
            TransportError::Transient(err) => self.retry_or_fail(err, false),
            TransportError::Permanent(err) => Err(err),
        };
        match delay {
            Ok(delay) => Polled::ResendAt(Instant::now() + delay),
            Err(err) => Polled::Ready(Err(err)),
        }
    }

    fn start(&self, mode: InvocationMode) -> Result<()> {
        let mut progress = self.progress.lock();
        match progress.state {
            InvocationState::Unsent => {
                progress.state = InvocationState::Pending;
                progress.mode = Some(mode);
                debug!("sending {} to {} ({:?})", self.operation, progress.target, mode);
                Ok(())
            }
            InvocationState::Done => Err(OrbError::BadInvOrder(OrderViolation::RequestAlreadySent)),
            _ => Err(OrbError::BadInvOrder(OrderViolation::DuplicateSend)),
        }
    }

    fn complete(&self, outcome: Result<Bytes>) {
        {
            let mut progress = self.progress.lock();
            progress.outcome = Some(outcome);
            progress.state = InvocationState::Done;
        }
        self.changed.notify_all();
    }

    /// Transmit until the transport accepts the request, following
    /// forwards and applying the retry policy
    fn transmit<T>(
        &self,
        response_expected: bool,
        mut send: impl FnMut(&dyn Transport, Bytes) -> TransportResult<T>,
    ) -> Result<T> {
        loop {
            let failure = match self.attempt(response_expected, &mut send) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            match failure {
                TransportError::Redirect { target, permanent } => {
                    self.follow_forward(target, permanent)?
                }
                TransportError::Transient(err) => pause(self.retry_or_fail(err, false)?),
                TransportError::Permanent(err) => return Err(err),
            }
        }
    }

    fn attempt<T>(
        &self,
        response_expected: bool,
        send: &mut impl FnMut(&dyn Transport, Bytes) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let (target, binding, attempt) = {
            let mut progress = self.progress.lock();
            progress.attempts += 1;
            (progress.target.clone(), progress.binding.clone(), progress.attempts)
        };
        trace!("{} to {}: attempt {}", self.operation, target, attempt);

        let transport = match binding {
            Some(transport) => transport,
            None => {
                let transport = self.connector.bind(&target)?;
                self.progress.lock().binding = Some(Arc::clone(&transport));
                transport
            }
        };
        let request = self
            .marshaler
            .encode(&OutgoingRequest {
                key: target.key.clone(),
                operation: self.operation.clone(),
                args: self.args.clone(),
                response_expected,
            })
            .map_err(TransportError::Permanent)?;
        send(transport.as_ref(), request)
    }

    fn follow_forward(&self, target: ObjectRef, permanent: bool) -> Result<()> {
        let mut progress = self.progress.lock();
        progress.forwards += 1;
        if progress.forwards > self.config.max_forwards {
            warn!(
                "{} exceeded {} location forwards",
                self.operation, self.config.max_forwards
            );
            return Err(OrbError::TooManyForwards(self.config.max_forwards));
        }
        debug!(
            "{} forwarded to {} (permanent: {})",
            self.operation, target, permanent
        );
        if permanent {
            progress.base_target = target.clone();
        }
        progress.target = target;
        progress.binding = None;
        Ok(())
    }

    /// Decide whether `err` is retried; returns the interval to wait first
    fn retry_or_fail(&self, err: OrbError, server_reported: bool) -> Result<Duration> {
        let attempts = self.progress.lock().attempts;
        match self.config.retry.decide(&err, attempts, server_reported) {
            RetryDecision::Retry(interval) => {
                debug!(
                    "retrying {} after attempt {} of {}: {}",
                    self.operation, attempts, self.config.retry.max_attempts, err
                );
                if !server_reported {
                    // Fall back from a transient forward and reconnect
                    let mut progress = self.progress.lock();
                    progress.target = progress.base_target.clone();
                    progress.binding = None;
                }
                Ok(interval)
            }
            RetryDecision::GiveUp => Err(err),
            RetryDecision::Exhausted => {
                warn!("{} failed after {} attempts: {}", self.operation, attempts, err);
                Err(OrbError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                })
            }
        }
    }

    fn handle_reply(&self, reply: Bytes) -> ReplyAction {
        let status = match self.marshaler.decode(reply) {
            Ok(status) => status,
            Err(err) => return ReplyAction::Complete(Err(err)),
        };
        match status {
            ReplyStatus::NoException(body) => ReplyAction::Complete(Ok(body)),
            ReplyStatus::UserException { id, body } => {
                ReplyAction::Complete(Err(OrbError::UserException { id, body }))
            }
            ReplyStatus::SystemException(err) => resend_or(self.retry_or_fail(err, true)),
            ReplyStatus::LocationForward { target, permanent } => {
                resend_or(self.follow_forward(target, permanent).map(|()| Duration::ZERO))
            }
        }
    }

    fn handle_transport_reply(&self, reply: TransportResult<Bytes>) -> ReplyAction {
        match reply {
            Ok(reply) => self.handle_reply(reply),
            Err(TransportError::Redirect { target, permanent }) => {
                resend_or(self.follow_forward(target, permanent).map(|()| Duration::ZERO))
            }
            Err(TransportError::Transient(err)) => resend_or(self.retry_or_fail(err, false)),
            Err(TransportError::Permanent(err)) => ReplyAction::Complete(Err(err)),
        }
    }

    fn await_reply(&self, mut pending: Box<dyn PendingReply>) -> Result<Bytes> {
        loop {
            match self.handle_transport_reply(pending.wait()) {
                ReplyAction::Complete(result) => return result,
                ReplyAction::Resend(delay) => {
                    pause(delay);
                    pending =
                        self.transmit(true, |transport, request| transport.deferred(request))?
                }
            }
        }
    }

    fn tracker(&self) -> Option<Arc<PendingInvocationSet>> {
        self.tracker.lock().as_ref().and_then(Weak::upgrade)
    }

    fn untrack(&self) {
        if let Some(set) = self.tracker() {
            set.remove_deferred(self);
        }
    }
}

fn check_deferred(progress: &Progress) -> Result<()> {
    match progress.mode {
        None => Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent)),
        Some(InvocationMode::Deferred) => Ok(()),
        Some(_) => Err(OrbError::BadInvOrder(OrderViolation::SynchronousRequest)),
    }
}

fn stored_outcome(progress: &Progress) -> Result<Bytes> {
    progress
        .outcome
        .clone()
        .unwrap_or(Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent)))
}

fn resend_or(result: Result<Duration>) -> ReplyAction {
    match result {
        Ok(delay) => ReplyAction::Resend(delay),
        Err(err) => ReplyAction::Complete(Err(err)),
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

impl std::fmt::Debug for ClientInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.progress.lock();
        f.debug_struct("ClientInvocation")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("target", &progress.target)
            .field("state", &progress.state)
            .field("attempts", &progress.attempts)
            .finish()
    }
}

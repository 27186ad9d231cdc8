//! Invocation Tests - Client State Machine, Retries and Deferred Requests
//!
//! These tests exercise outgoing invocations end to end:
//! - Retry modes against injected transport failures
//! - Server-reported transient errors and the remote retry attribute
//! - Deferred, polled and oneway sends with their usage-order errors
//! - The pending invocation set

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use common::*;
use orb::invocation::{CollocatedCodec, CollocatedConnector, Connector};
use orb::{
    ClientConfig, CompletionStatus, InvocationState, ObjectKey, ObjectRef, OrbClient, OrbError,
    OrderViolation, PendingInvocationSet, RetryMode, RetryPolicy,
};

fn flaky_client(flaky: &Arc<FlakyConnector>, config: ClientConfig) -> OrbClient {
    OrbClient::with_config(
        Arc::clone(flaky) as Arc<dyn Connector>,
        Arc::new(CollocatedCodec),
        config,
    )
}

fn always(max_attempts: u32) -> ClientConfig {
    ClientConfig::default().with_retry(
        RetryPolicy::default()
            .with_mode(RetryMode::Always)
            .with_max_attempts(max_attempts),
    )
}

/// Test: an always-transient target is tried exactly max_attempts times
#[test]
fn test_retries_exhausted_after_max_attempts() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("retry", "east", &connector);
    let servant = EchoServant::new();
    let reference = ts.activate(servant.clone());
    ts.server.activate().unwrap();

    let flaky = FlakyConnector::always_failing(connector.clone());
    let client = flaky_client(&flaky, always(3));
    let request = client.create_request(&reference, "echo", Bytes::new());

    match request.invoke() {
        Err(OrbError::RetriesExhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(last.is_transient());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(flaky.transmissions(), 3);
    assert_eq!(request.attempts(), 3);
    assert_eq!(request.state(), InvocationState::Done);
    assert_eq!(servant.calls(), 0);
}

/// Test: strict mode resends a request that never reached the server
#[test]
fn test_strict_retry_recovers() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("retry", "east", &connector);
    let servant = EchoServant::new();
    let reference = ts.activate(servant.clone());
    ts.server.activate().unwrap();

    let flaky = FlakyConnector::new(connector.clone(), 1, CompletionStatus::No);
    let client = flaky_client(&flaky, ClientConfig::default());
    let request = client.create_request(&reference, "echo", Bytes::from_static(b"again"));

    assert_eq!(request.invoke().unwrap(), Bytes::from_static(b"again"));
    assert_eq!(request.attempts(), 2);
    assert_eq!(flaky.transmissions(), 2);
    // The failed binding is dropped and re-resolved
    assert_eq!(flaky.binds(), 2);
    assert_eq!(servant.calls(), 1);
}

/// Test: strict mode refuses to resend once the request may have executed
#[test]
fn test_strict_refuses_maybe_completed() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("retry", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();

    let flaky = FlakyConnector::new(connector.clone(), 1, CompletionStatus::Maybe);
    let client = flaky_client(&flaky, ClientConfig::default());
    let err = client.invoke(&reference, "echo", Bytes::new()).unwrap_err();

    assert_eq!(err.completion(), Some(CompletionStatus::Maybe));
    assert_eq!(flaky.transmissions(), 1);

    // Always mode resends regardless
    let flaky = FlakyConnector::new(connector.clone(), 1, CompletionStatus::Maybe);
    let client = flaky_client(&flaky, always(2));
    client.invoke(&reference, "echo", Bytes::new()).unwrap();
    assert_eq!(flaky.transmissions(), 2);
}

/// Test: never mode gives up on the first failure with the original error
#[test]
fn test_never_mode() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("retry", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();

    let flaky = FlakyConnector::new(connector.clone(), 1, CompletionStatus::No);
    let client = flaky_client(&flaky, ClientConfig::default().with_retry(RetryPolicy::never()));
    let err = client.invoke(&reference, "echo", Bytes::new()).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(flaky.transmissions(), 1);
}

/// Test: transient errors reported by a discarding server are only
/// retried with the remote attribute set
#[test]
fn test_server_reported_transient_errors() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("retry", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.root_manager().discard_requests(false).unwrap();

    let client = collocated_client(&connector, always(3));
    let request = client.create_request(&reference, "echo", Bytes::new());
    let err = request.invoke().unwrap_err();
    assert!(err.is_transient(), "unexpected error {:?}", err);
    assert_eq!(request.attempts(), 1);

    let remote = ClientConfig::default().with_retry(
        RetryPolicy::default()
            .with_mode(RetryMode::Always)
            .with_max_attempts(3)
            .with_remote(true),
    );
    let client = collocated_client(&connector, remote);
    let request = client.create_request(&reference, "echo", Bytes::new());
    assert!(matches!(
        request.invoke(),
        Err(OrbError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(ts.server.dispatcher().stats().snapshot().requests_rejected, 4);
}

/// Test: a client started before its server retries until the endpoint appears
#[test]
fn test_startup_race() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let config = ClientConfig::default().with_retry(
        RetryPolicy::default()
            .with_max_attempts(100)
            .with_interval(Duration::from_millis(5)),
    );
    let client = collocated_client(&connector, config);

    // The server exists but is not reachable through the client's connector yet
    let unreachable = CollocatedConnector::new();
    let ts = TestServer::start("late", "late", &unreachable);
    ts.server.activate().unwrap();
    let reference = ts.activate(EchoServant::new());

    let starter = {
        let connector = Arc::clone(&connector);
        let dispatcher = Arc::clone(ts.server.dispatcher());
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            connector.register("late", dispatcher);
        })
    };

    let request = client.create_request(&reference, "echo", Bytes::from_static(b"hello"));
    assert_eq!(request.invoke().unwrap(), Bytes::from_static(b"hello"));
    assert!(request.attempts() > 1);
    starter.join().unwrap();
}

/// Test: a forward loop is cut off by max_forwards
#[test]
fn test_forward_loop() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("loop", "east", &connector);
    ts.server.activate().unwrap();

    let looping = ObjectRef::new(ECHO_TYPE, "east", ObjectKey::from("loop"));
    ts.server
        .dispatcher()
        .register_forward(looping.key.clone(), looping.clone());

    let client = collocated_client(&connector, ClientConfig::default().with_max_forwards(4));
    let request = client.create_request(&looping, "echo", Bytes::new());
    assert_eq!(request.invoke(), Err(OrbError::TooManyForwards(4)));
    assert_eq!(request.forwards(), 5);
    assert_eq!(request.state(), InvocationState::Done);
}

/// Test: the usage-order errors of the invocation state machine
#[test]
fn test_usage_order_errors() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("order", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();
    let client = collocated_client(&connector, ClientConfig::default());
    fn order<T>(violation: OrderViolation) -> Result<T, OrbError> {
        Err(OrbError::BadInvOrder(violation))
    }

    let unsent = client.create_request(&reference, "echo", Bytes::new());
    assert_eq!(unsent.get_response(), order(OrderViolation::RequestNotSent));
    assert_eq!(unsent.poll_response(), order(OrderViolation::RequestNotSent));

    let sync = client.create_request(&reference, "echo", Bytes::new());
    sync.invoke().unwrap();
    assert_eq!(sync.invoke(), order(OrderViolation::RequestAlreadySent));
    assert_eq!(sync.send_deferred(), order(OrderViolation::RequestAlreadySent));
    assert_eq!(sync.poll_response(), order(OrderViolation::SynchronousRequest));

    let oneway = client.create_request(&reference, "echo", Bytes::new());
    oneway.send_oneway().unwrap();
    assert_eq!(oneway.get_response(), order(OrderViolation::SynchronousRequest));

    let deferred = client.create_request(&reference, "sleep", Bytes::from_static(b"50"));
    deferred.send_deferred().unwrap();
    assert_eq!(deferred.invoke(), order(OrderViolation::DuplicateSend));
    assert_eq!(deferred.send_oneway(), order(OrderViolation::DuplicateSend));
    assert_eq!(deferred.get_response().unwrap(), Bytes::from_static(b"50"));
    assert_eq!(
        deferred.get_response(),
        order(OrderViolation::ResponseAlreadyReceived)
    );
    assert_eq!(
        deferred.poll_response(),
        order(OrderViolation::ResponseAlreadyReceived)
    );
}

/// Test: polling a deferred request until its reply arrives
#[test]
fn test_poll_until_ready() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("poll", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();
    let client = collocated_client(&connector, ClientConfig::default());

    let request = client.create_request(&reference, "sleep", Bytes::from_static(b"30"));
    request.send_deferred().unwrap();
    assert_eq!(request.state(), InvocationState::Sent);
    assert!(!request.poll_response().unwrap());

    let mut polls = 1;
    while !request.poll_response().unwrap() {
        polls += 1;
        thread::sleep(Duration::from_millis(2));
    }
    assert!(polls > 1);
    assert_eq!(request.state(), InvocationState::Received);
    assert!(request.poll_response().unwrap());
    assert_eq!(request.get_response().unwrap(), Bytes::from_static(b"30"));
    assert_eq!(request.state(), InvocationState::Done);
}

/// Test: a deferred send that cannot be transmitted reports through get_response
#[test]
fn test_deferred_send_failure() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let client = collocated_client(&connector, ClientConfig::default().with_retry(RetryPolicy::never()));
    let nowhere = ObjectRef::new(ECHO_TYPE, "nowhere", ObjectKey::from("obj"));

    let request = client.create_request(&nowhere, "echo", Bytes::new());
    request.send_deferred().unwrap();
    assert!(request.poll_response().unwrap());
    let err = request.get_response().unwrap_err();
    assert!(err.is_transient(), "unexpected error {:?}", err);
    assert!(client.pending().is_empty());
}

/// Test: get_response waits out a concurrent poller
#[test]
fn test_get_response_from_another_thread() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("poll", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();
    let client = collocated_client(&connector, ClientConfig::default());

    let request = client.create_request(&reference, "sleep", Bytes::from_static(b"40"));
    request.send_deferred().unwrap();

    let waiter = {
        let request = Arc::clone(&request);
        thread::spawn(move || request.get_response())
    };
    // Polls while the waiter is receiving report not ready or already consumed
    for _ in 0..5 {
        match request.poll_response() {
            Ok(_) | Err(OrbError::BadInvOrder(OrderViolation::ResponseAlreadyReceived)) => {}
            Err(err) => panic!("unexpected poll error {:?}", err),
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(waiter.join().unwrap().unwrap(), Bytes::from_static(b"40"));
    assert_eq!(request.state(), InvocationState::Done);
}

/// Test: the pending set hands back completed requests first
#[test]
fn test_pending_set_take_next_completed() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("pending", "east", &connector);
    let reference = ts.activate(EchoServant::new());
    ts.server.activate().unwrap();
    let client = collocated_client(&connector, ClientConfig::default());

    let slow = client.create_request(&reference, "sleep", Bytes::from_static(b"80"));
    let fast = client.create_request(&reference, "echo", Bytes::from_static(b"fast"));
    client
        .send_multiple_deferred(&[Arc::clone(&slow), Arc::clone(&fast)])
        .unwrap();
    assert_eq!(client.pending().len(), 2);

    // Wait until the fast reply has been polled in
    while fast.state() != InvocationState::Received {
        client.poll_next_response().unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let first = client.get_next_response().unwrap();
    assert_eq!(first.id(), fast.id());
    assert_eq!(first.result(), Some(Ok(Bytes::from_static(b"fast"))));

    let second = client.get_next_response().unwrap();
    assert_eq!(second.id(), slow.id());
    assert_eq!(second.result(), Some(Ok(Bytes::from_static(b"80"))));

    assert!(client.pending().is_empty());
    assert!(matches!(
        client.get_next_response(),
        Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent))
    ));
}

/// Test: oneway batches and a standalone pending set
#[test]
fn test_send_multiple_oneway() {
    init_logging();

    let connector = Arc::new(CollocatedConnector::new());
    let ts = TestServer::start("oneway", "east", &connector);
    let servant = EchoServant::new();
    let reference = ts.activate(servant.clone());
    ts.server.activate().unwrap();
    let client = collocated_client(&connector, ClientConfig::default());

    let set = PendingInvocationSet::new();
    let requests: Vec<_> = (0..5)
        .map(|i| client.create_request(&reference, "echo", Bytes::from(format!("{}", i))))
        .collect();
    set.send_multiple_oneway(&requests).unwrap();

    assert!(requests.iter().all(|r| r.state() == InvocationState::Done));
    assert!(set.is_empty());
    assert!(client.pending().is_empty());
    assert_eq!(servant.calls(), 5);
}

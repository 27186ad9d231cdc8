//! Shared fixtures for the integration tests
//!
//! - Logging setup
//! - Test servants and a recording etherealizer
//! - Server/client wiring over the collocated transport
//! - A connector that injects transport failures
//! - Latency and success counters for the stress tests

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing_subscriber::EnvFilter;

use orb::dispatch::current;
use orb::invocation::{
    CollocatedConnector, Connector, PendingReply, Transport, TransportError, TransportResult,
};
use orb::{
    AdapterPolicies, ClientConfig, CompletionStatus, Etherealizer, ObjectAdapter, ObjectKey,
    ObjectRef, OrbClient, OrbConfig, OrbError, OrbServer, Servant, ServantHandle,
    UpcallException, UpcallResult,
};

pub const ECHO_TYPE: &str = "IDL:Test/Echo:1.0";

/// Initialize tracing once per test binary
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Echo servant
///
/// Operations:
/// - `echo`: returns the arguments
/// - `fail`: raises `IDL:Test/Failure:1.0` with the arguments as body
/// - `panic`: panics
/// - `sleep`: sleeps for the number of milliseconds in the arguments
/// - `whoami`: returns `adapter/object_id/operation` from the upcall context
pub struct EchoServant {
    calls: AtomicU64,
}

impl EchoServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Servant for EchoServant {
    fn repository_id(&self) -> &str {
        ECHO_TYPE
    }

    fn invoke(&self, operation: &str, args: Bytes) -> UpcallResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match operation {
            "echo" => Ok(args),
            "fail" => Err(UpcallException::User {
                id: "IDL:Test/Failure:1.0".to_string(),
                body: args,
            }),
            "panic" => panic!("echo servant asked to panic"),
            "sleep" => {
                let millis = String::from_utf8_lossy(&args).parse::<u64>().unwrap_or(10);
                std::thread::sleep(Duration::from_millis(millis));
                Ok(args)
            }
            "whoami" => {
                let ctx = current::current().ok_or(OrbError::Unknown("no upcall context".into()))?;
                Ok(Bytes::from(format!(
                    "{}/{}/{}",
                    ctx.adapter, ctx.object_id, ctx.operation
                )))
            }
            other => Err(UpcallException::System(OrbError::Unknown(format!(
                "no operation {}",
                other
            )))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Servant whose `block` operation waits until the gate opens
pub struct GateServant {
    open: Mutex<bool>,
    changed: Condvar,
    inside: AtomicUsize,
}

impl GateServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            changed: Condvar::new(),
            inside: AtomicUsize::new(0),
        })
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    /// Upcalls currently blocked at the gate
    pub fn inside(&self) -> usize {
        self.inside.load(Ordering::SeqCst)
    }

    /// Spin until `count` upcalls are blocked at the gate
    pub fn wait_inside(&self, count: usize) {
        while self.inside() < count {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Servant for GateServant {
    fn repository_id(&self) -> &str {
        "IDL:Test/Gate:1.0"
    }

    fn invoke(&self, operation: &str, args: Bytes) -> UpcallResult {
        if operation == "block" {
            self.inside.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.changed.wait(&mut open);
            }
            drop(open);
            self.inside.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One etherealize callback
#[derive(Clone, Debug, PartialEq)]
pub struct Etherealized {
    pub key: ObjectKey,
    pub cleanup_in_progress: bool,
    pub remaining_activations: bool,
}

/// Etherealizer recording every callback
#[derive(Default)]
pub struct RecordingEtherealizer {
    calls: Mutex<Vec<Etherealized>>,
}

impl RecordingEtherealizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Etherealized> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count_for(&self, key: &ObjectKey) -> usize {
        self.calls.lock().iter().filter(|c| &c.key == key).count()
    }
}

impl Etherealizer for RecordingEtherealizer {
    fn etherealize(
        &self,
        key: &ObjectKey,
        _servant: ServantHandle,
        cleanup_in_progress: bool,
        remaining_activations: bool,
    ) {
        self.calls.lock().push(Etherealized {
            key: key.clone(),
            cleanup_in_progress,
            remaining_activations,
        });
    }
}

/// A server with its root adapter, reachable through `connector`
pub struct TestServer {
    pub server: Arc<OrbServer>,
    pub adapter: Arc<ObjectAdapter>,
    pub etherealizer: Arc<RecordingEtherealizer>,
}

impl TestServer {
    /// Start a server on `endpoint`, registered with `connector`
    pub fn start(server_id: &str, endpoint: &str, connector: &CollocatedConnector) -> Self {
        Self::start_with(server_id, endpoint, connector, AdapterPolicies::default())
    }

    pub fn start_with(
        server_id: &str,
        endpoint: &str,
        connector: &CollocatedConnector,
        policies: AdapterPolicies,
    ) -> Self {
        let mut config = OrbConfig::new(server_id);
        config.endpoint = endpoint.to_string();
        config.adapter = policies;
        let server = Arc::new(OrbServer::new(config));
        let adapter = server.root_adapter().expect("root adapter");
        let etherealizer = RecordingEtherealizer::new();
        adapter.set_etherealizer(etherealizer.clone());
        connector.register(endpoint, Arc::clone(server.dispatcher()));
        Self {
            server,
            adapter,
            etherealizer,
        }
    }

    /// Activate `servant` and return a reference to it
    pub fn activate(&self, servant: ServantHandle) -> ObjectRef {
        let id = self.adapter.activate_object(servant).expect("activate object");
        self.adapter.create_reference(&id, ECHO_TYPE)
    }
}

/// Client over the collocated transport
pub fn collocated_client(connector: &Arc<CollocatedConnector>, config: ClientConfig) -> OrbClient {
    OrbClient::collocated(Arc::clone(connector), config)
}

/// Shared state of a [`FlakyConnector`]
pub struct FlakyState {
    failures_left: AtomicU32,
    completion: CompletionStatus,
    transmissions: AtomicU32,
    binds: AtomicU32,
}

impl FlakyState {
    fn inject(&self) -> TransportResult<()> {
        self.transmissions.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Transient(OrbError::Transient {
                reason: "injected connection failure".to_string(),
                completion: self.completion,
            }));
        }
        Ok(())
    }
}

/// Connector whose transports fail the first transmissions
pub struct FlakyConnector {
    inner: Arc<dyn Connector>,
    state: Arc<FlakyState>,
}

impl FlakyConnector {
    pub fn new(inner: Arc<dyn Connector>, failures: u32, completion: CompletionStatus) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Arc::new(FlakyState {
                failures_left: AtomicU32::new(failures),
                completion,
                transmissions: AtomicU32::new(0),
                binds: AtomicU32::new(0),
            }),
        })
    }

    /// Every transmission fails
    pub fn always_failing(inner: Arc<dyn Connector>) -> Arc<Self> {
        Self::new(inner, u32::MAX, CompletionStatus::No)
    }

    pub fn transmissions(&self) -> u32 {
        self.state.transmissions.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> u32 {
        self.state.binds.load(Ordering::SeqCst)
    }
}

impl Connector for FlakyConnector {
    fn bind(&self, target: &ObjectRef) -> TransportResult<Arc<dyn Transport>> {
        self.state.binds.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.bind(target)?;
        Ok(Arc::new(FlakyTransport {
            inner,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FlakyTransport {
    inner: Arc<dyn Transport>,
    state: Arc<FlakyState>,
}

impl Transport for FlakyTransport {
    fn request(&self, request: Bytes) -> TransportResult<Bytes> {
        self.state.inject()?;
        self.inner.request(request)
    }

    fn oneway(&self, request: Bytes) -> TransportResult<()> {
        self.state.inject()?;
        self.inner.oneway(request)
    }

    fn deferred(&self, request: Bytes) -> TransportResult<Box<dyn PendingReply>> {
        self.state.inject()?;
        self.inner.deferred(request)
    }
}

/// Thread-safe success/failure and latency counters
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    total_latency_ns: AtomicU64,
    min_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            min_latency_ns: AtomicU64::new(u64::MAX),
            max_latency_ns: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let nanos = latency.as_nanos() as u64;
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(nanos, Ordering::Relaxed);
        self.min_latency_ns.fetch_min(nanos, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let count = self.success_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed) / count)
    }

    pub fn min_latency(&self) -> Duration {
        match self.min_latency_ns.load(Ordering::Relaxed) {
            u64::MAX => Duration::ZERO,
            nanos => Duration::from_nanos(nanos),
        }
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed))
    }

    pub fn print_report(&self, title: &str) {
        let total = self.success_count() + self.failure_count();
        println!("\n=== {} ===", title);
        println!("Total: {}", total);
        println!("Successful: {}", self.success_count());
        println!("Failed: {}", self.failure_count());
        println!("Avg latency: {:?}", self.avg_latency());
        println!("Min latency: {:?}", self.min_latency());
        println!("Max latency: {:?}", self.max_latency());
    }
}

impl Default for ConcurrentStats {
    fn default() -> Self {
        Self::new()
    }
}

//! ORB Echo Example
//!
//! Hosts an echo servant in an [`OrbServer`] and drives it through an
//! [`OrbClient`] over the collocated transport.
//!
//! ```text
//!   OrbClient ──> CollocatedConnector ──> Dispatcher ──> RootPOA ──> EchoServant
//! ```
//!
//! Walkthrough:
//! - Requests sent while the manager is holding wait for activation
//! - Synchronous echo and reverse calls
//! - User exceptions raised by the servant
//! - A batch of deferred requests collected through the pending set
//! - Graceful shutdown etherealizing the servant
//!
//! Usage:
//!   cargo run -p orb-echo -- --deferred 16

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use orb::invocation::CollocatedConnector;
use orb::{
    ClientConfig, Etherealizer, ManagerState, ObjectKey, OrbClient, OrbError, OrbServer,
    OrbServerBuilder, RetryPolicy, Servant, ServantHandle, UpcallException, UpcallResult,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const ECHO_TYPE: &str = "IDL:Demo/Echo:1.0";

#[derive(Parser, Debug)]
#[command(name = "orb-echo", about = "Echo servant over the collocated transport")]
struct Args {
    /// Server id embedded in object keys
    #[arg(long, default_value = "echo-server")]
    server_id: String,

    /// Endpoint name the server registers under
    #[arg(long, default_value = "local")]
    endpoint: String,

    /// Number of deferred requests to send in one batch
    #[arg(long, default_value_t = 8)]
    deferred: usize,

    /// Milliseconds the manager holds requests before activating
    #[arg(long, default_value_t = 100)]
    hold_ms: u64,

    /// Retry attempts for transient failures
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

struct EchoServant {
    calls: AtomicUsize,
}

impl Servant for EchoServant {
    fn repository_id(&self) -> &str {
        ECHO_TYPE
    }

    fn invoke(&self, operation: &str, args: Bytes) -> UpcallResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match operation {
            "echo" => Ok(args),
            "reverse" => {
                let mut reversed = args.to_vec();
                reversed.reverse();
                Ok(Bytes::from(reversed))
            }
            "refuse" => Err(UpcallException::User {
                id: "IDL:Demo/Refused:1.0".to_string(),
                body: args,
            }),
            other => Err(OrbError::Unknown(format!("no operation {}", other)).into()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct LoggingEtherealizer;

impl Etherealizer for LoggingEtherealizer {
    fn etherealize(
        &self,
        key: &ObjectKey,
        servant: ServantHandle,
        cleanup_in_progress: bool,
        _remaining_activations: bool,
    ) {
        let calls = servant
            .as_any()
            .downcast_ref::<EchoServant>()
            .map(|s| s.calls.load(Ordering::Relaxed))
            .unwrap_or_default();
        info!(
            "etherealized {} after {} calls (cleanup: {})",
            key, calls, cleanup_in_progress
        );
    }
}

fn start_server(args: &Args, connector: &CollocatedConnector) -> orb::Result<Arc<OrbServer>> {
    let server = Arc::new(
        OrbServerBuilder::new()
            .server_id(args.server_id.clone())
            .endpoint(args.endpoint.clone())
            .initial_state(ManagerState::Holding)
            .build(),
    );
    server
        .root_manager()
        .add_state_observer(Arc::new(|id: &str, state: ManagerState| {
            info!("manager {} is now {:?}", id, state);
        }));
    connector.register(&args.endpoint, Arc::clone(server.dispatcher()));
    Ok(server)
}

fn run_client(client: &OrbClient, target: &orb::ObjectRef, deferred: usize) -> orb::Result<()> {
    info!("Calling echo...");
    let reply = client.invoke(target, "echo", Bytes::from_static(b"Hello, ORB!"))?;
    info!("  echo returned {:?}", String::from_utf8_lossy(&reply));

    info!("Calling reverse...");
    let reply = client.invoke(target, "reverse", Bytes::from_static(b"hello"))?;
    assert_eq!(reply.as_ref(), b"olleh");
    info!("  reverse returned {:?}", String::from_utf8_lossy(&reply));

    info!("Calling refuse...");
    match client.invoke(target, "refuse", Bytes::from_static(b"no")) {
        Err(OrbError::UserException { id, .. }) => info!("  refuse raised {}", id),
        other => warn!("  refuse returned {:?}", other),
    }

    info!("Sending {} deferred requests...", deferred);
    let requests: Vec<_> = (0..deferred)
        .map(|i| client.create_request(target, "echo", Bytes::from(format!("deferred-{}", i))))
        .collect();
    client.send_multiple_deferred(&requests)?;
    while !client.pending().is_empty() {
        let next = client.get_next_response()?;
        match next.result() {
            Some(Ok(reply)) => info!("  request {} replied {:?}", next.id(), String::from_utf8_lossy(&reply)),
            Some(Err(err)) => warn!("  request {} failed: {}", next.id(), err),
            None => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    info!("ORB Echo Example");
    info!("================");

    let connector = Arc::new(CollocatedConnector::new());
    let server = start_server(&args, &connector)?;

    let adapter = server.root_adapter()?;
    adapter.set_etherealizer(Arc::new(LoggingEtherealizer));
    let id = adapter.activate_object(Arc::new(EchoServant {
        calls: AtomicUsize::new(0),
    }))?;
    let target = adapter.create_reference(&id, ECHO_TYPE);
    info!("Echo servant active as {}", target);

    // Requests arriving now are held until the manager is activated
    let activator = {
        let server = Arc::clone(&server);
        let hold = Duration::from_millis(args.hold_ms);
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            info!("Activating the root manager");
            server.activate()
        })
    };

    let config = ClientConfig::default()
        .with_retry(RetryPolicy::default().with_max_attempts(args.retries));
    let client = OrbClient::collocated(Arc::clone(&connector), config);
    let deferred = args.deferred;

    // The collocated transport blocks; keep it off the async workers
    let outcome = tokio::task::spawn_blocking(move || run_client(&client, &target, deferred)).await?;
    activator.await??;

    match &outcome {
        Ok(()) => info!("All calls completed"),
        Err(err) => warn!("Client failed: {}", err),
    }

    info!("Shutting down");
    server.shutdown(true)?;
    let stats = server.dispatcher().stats().snapshot();
    info!(
        "Dispatched {} requests ({} completed, {} rejected)",
        stats.requests_received, stats.requests_completed, stats.requests_rejected
    );

    outcome.map_err(Into::into)
}

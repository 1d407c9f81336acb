//! Test framework core infrastructure

pub mod backend;
pub mod certs;
pub mod client;
pub mod resources;

use common::ResourceKey;
use portico::apis::memory::InMemoryCluster;
use portico::config::{ControllerConfig, RetryConfig, TimeoutConfig};
use portico::controller::queue::ErrorReporter;
use portico::controller::IngressController;
use portico::error::ClusterError;
use portico::proxy::backends::BackendResolver;
use portico::proxy::forwarder::build_client;
use portico::proxy::request_handler::ProxyContext;
use portico::proxy::router::RoutingTable;
use portico::proxy::server::{Listeners, ProxyServer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error type shared by scenarios and helpers
pub type TestError = Box<dyn std::error::Error + Send + Sync>;

/// Test result type
pub type TestResult = Result<(), TestError>;

static INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_crypto() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Collects keys the queue gave up on
#[derive(Default)]
pub struct RecordingReporter {
    dropped: Mutex<Vec<(ResourceKey, u32)>>,
}

impl RecordingReporter {
    pub fn dropped(&self) -> Vec<(ResourceKey, u32)> {
        self.dropped.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, key: &ResourceKey, attempts: u32, _error: &str) {
        self.dropped.lock().unwrap().push((key.clone(), attempts));
    }
}

/// A running controller plus proxy on loopback ports
pub struct TestContext {
    pub cluster: Arc<InMemoryCluster>,
    pub table: Arc<RoutingTable>,
    pub reporter: Arc<RecordingReporter>,
    pub config: ControllerConfig,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub timeouts: super::TimeoutConfig,
    shutdown: CancellationToken,
    controller: Option<JoinHandle<Result<(), ClusterError>>>,
    server: Option<JoinHandle<()>>,
}

/// Controller settings for tests: loopback listeners, fast retries, no cache
pub fn test_controller_config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        http_bind_addr: "127.0.0.1:0".to_string(),
        https_bind_addr: "127.0.0.1:0".to_string(),
        metrics_bind_addr: Some("127.0.0.1:0".to_string()),
        status_addresses: vec!["127.0.0.1".to_string()],
        service_cache_ttl_secs: 0,
        retry: RetryConfig {
            base_delay_ms: 5,
            max_delay_secs: 1,
            max_attempts: 5,
            jitter: false,
        },
        timeouts: TimeoutConfig {
            api_timeout_secs: 2,
            connect_timeout_secs: 1,
            request_timeout_secs: 2,
            shutdown_grace_secs: 1,
        },
        ..Default::default()
    }
}

impl TestContext {
    pub async fn start(config: &super::TestConfig) -> Result<Self, TestError> {
        let controller_config = test_controller_config();
        let cluster = Arc::new(InMemoryCluster::new());
        let table = Arc::new(RoutingTable::new());
        let reporter = Arc::new(RecordingReporter::default());

        let listeners = Listeners::bind(&controller_config).await?;
        let http_addr = listeners.http_addr()?;
        let https_addr = listeners.https_addr()?;
        let metrics_addr = listeners.metrics_addr();

        let resolver = Arc::new(BackendResolver::new(
            cluster.clone(),
            controller_config.service_cache_ttl(),
            controller_config.timeouts.api_timeout(),
        ));
        let context = ProxyContext {
            table: table.clone(),
            resolver,
            client: build_client(controller_config.timeouts.connect_timeout()),
            rewrite_host: controller_config.rewrite_host,
            request_timeout: controller_config.timeouts.request_timeout(),
        };
        let server = ProxyServer::new(context, &controller_config)?;
        let controller = IngressController::with_reporter(
            cluster.clone(),
            table.clone(),
            &controller_config,
            reporter.clone(),
        );

        let shutdown = CancellationToken::new();
        let controller = tokio::spawn(controller.run(shutdown.clone()));
        let server = tokio::spawn(server.serve(listeners, shutdown.clone()));

        Ok(Self {
            cluster,
            table,
            reporter,
            config: controller_config,
            http_addr,
            https_addr,
            metrics_addr,
            timeouts: config.timeouts.clone(),
            shutdown,
            controller: Some(controller),
            server: Some(server),
        })
    }

    /// Wait until the published table satisfies `condition`
    pub async fn wait_for_table<F>(&self, what: &str, condition: F) -> TestResult
    where
        F: Fn(&portico::proxy::router::RoutingTableSnapshot) -> bool,
    {
        let table = self.table.clone();
        wait_until(what, self.timeouts.reconciliation, || condition(&table.current())).await
    }

    /// Stop the controller and listeners, waiting for both to finish
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(controller) = self.controller.take() {
            match tokio::time::timeout(Duration::from_secs(10), controller).await {
                Ok(Ok(Ok(()))) => {}
                other => eprintln!("⚠️  Controller stopped abnormally: {:?}", other),
            }
        }
        if let Some(server) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(10), server).await.is_err() {
                eprintln!("⚠️  Proxy server did not stop in time");
            }
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> TestResult
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("timed out waiting for {}", what).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

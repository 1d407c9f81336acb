//! Portico Integration Test Framework
//!
//! Runs the whole controller in-process: an in-memory cluster feeds the
//! watch, the reconcile queue and workers publish routing snapshots, and the
//! real HTTP/HTTPS listeners serve them on loopback ports.
//!
//! ## Architecture
//!
//! - **framework/**: test context, echo backend, TLS client, certificates
//! - **scenarios/**: end-to-end behaviours, each with a fresh context
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all scenarios
//! cargo test --test integration_test
//!
//! # Run only some scenarios
//! PORTICO_TEST_SCENARIOS=redirect,tls_rejection cargo test --test integration_test
//! ```

#![allow(
    dead_code,
    clippy::expect_used,
    clippy::panic,
    clippy::unwrap_used
)]

pub mod framework;

pub use framework::{TestContext, TestResult};
use std::time::Duration;

/// Test configuration
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Scenario names to run; empty runs everything
    pub only: Vec<String>,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long to wait for a reconciliation to become visible
    pub reconciliation: Duration,
    /// Per-request client timeout
    pub request: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            timeouts: TimeoutConfig {
                reconciliation: Duration::from_secs(10),
                request: Duration::from_secs(10),
            },
        }
    }
}

impl TestConfig {
    /// Defaults, narrowed by `PORTICO_TEST_SCENARIOS` (comma separated)
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Ok(list) = std::env::var("PORTICO_TEST_SCENARIOS") {
            config.only = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config
    }

    pub fn enabled(&self, scenario: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|s| s == scenario)
    }
}

/// One end-to-end behaviour
#[async_trait::async_trait]
pub trait TestScenario: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut TestContext) -> TestResult;

    fn should_skip(&self, config: &TestConfig) -> bool {
        !config.enabled(self.name())
    }
}

/// Run `scenario` against a freshly started controller
pub async fn run_scenario(scenario: &dyn TestScenario) {
    framework::init_crypto();
    let config = TestConfig::load();
    if scenario.should_skip(&config) {
        println!("⏭️  Skipping scenario: {}", scenario.name());
        return;
    }

    let mut ctx = TestContext::start(&config)
        .await
        .expect("Failed to start test context");

    println!("🏃 Running scenario: {}", scenario.name());
    let result = scenario.run(&mut ctx).await;
    ctx.shutdown().await;

    match result {
        Ok(()) => println!("✅ Scenario passed: {}", scenario.name()),
        Err(e) => panic!("Scenario {} failed: {}", scenario.name(), e),
    }
}

//! Failing reconciliations are retried, then dropped
//!
//! Five consecutive list failures exhaust the retry budget: the key is
//! reported once with its attempt count and leaves the queue. The next
//! change to the resource starts over and succeeds.

use crate::integration::framework::backend::EchoBackend;
use crate::integration::framework::resources::{key, loopback_service, Ingress, TEST_NAMESPACE};
use crate::integration::framework::wait_until;
use crate::integration::{TestContext, TestResult, TestScenario};
use async_trait::async_trait;
use std::time::Duration;

pub struct RetryExhaustionTest;

#[async_trait]
impl TestScenario for RetryExhaustionTest {
    fn name(&self) -> &str {
        "retry_exhaustion"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        let backend = EchoBackend::start().await?;
        ctx.cluster
            .set_service(TEST_NAMESPACE, "my-service", loopback_service(backend.port()));

        ctx.cluster.fail_next_lists(ctx.config.retry.max_attempts as usize);
        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/", "my-service", backend.port())
                .build(),
        );

        let reporter = ctx.reporter.clone();
        wait_until("key dropped", ctx.timeouts.reconciliation, || {
            !reporter.dropped().is_empty()
        })
        .await?;
        assert_eq!(
            ctx.reporter.dropped(),
            vec![(key("web"), ctx.config.retry.max_attempts)]
        );
        assert!(ctx.table.current().routes().is_empty());
        println!("  ✓ Key dropped after {} attempts", ctx.config.retry.max_attempts);

        // Nothing else is retried once dropped
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.reporter.dropped().len(), 1);

        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/", "my-service", backend.port())
                .build(),
        );
        ctx.wait_for_table("route after recovery", |snapshot| {
            snapshot.match_route("svc.example.com", "/").is_some()
        })
        .await?;
        assert_eq!(ctx.reporter.dropped().len(), 1);
        println!("  ✓ Fresh change reconciled");

        Ok(())
    }
}

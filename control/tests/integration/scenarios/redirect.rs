//! Plaintext listener only redirects
//!
//! Even for hosts with a route, port 80 answers with a permanent redirect
//! to HTTPS and never contacts the backend.

use crate::integration::framework::backend::EchoBackend;
use crate::integration::framework::client::{http_request, TestRequest};
use crate::integration::framework::resources::{loopback_service, Ingress, TEST_NAMESPACE};
use crate::integration::{TestContext, TestResult, TestScenario};
use async_trait::async_trait;
use hyper::StatusCode;

pub struct RedirectTest;

#[async_trait]
impl TestScenario for RedirectTest {
    fn name(&self) -> &str {
        "redirect"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        let backend = EchoBackend::start().await?;
        ctx.cluster
            .set_service(TEST_NAMESPACE, "my-service", loopback_service(backend.port()));
        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/", "my-service", backend.port())
                .build(),
        );
        ctx.wait_for_table("route", |snapshot| {
            snapshot.match_route("svc.example.com", "/").is_some()
        })
        .await?;

        let response = http_request(
            ctx.http_addr,
            TestRequest::get("svc.example.com", "/a/b?c=d"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.header("location"),
            Some("https://svc.example.com/a/b?c=d")
        );
        println!("  ✓ GET redirected with 301");

        let response = http_request(
            ctx.http_addr,
            TestRequest::post("svc.example.com", "/form", "data"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.header("location"), Some("https://svc.example.com/form"));
        println!("  ✓ POST redirected with 308");

        // Hosts without a route are redirected too
        let response = http_request(
            ctx.http_addr,
            TestRequest::get("Unknown.Example.com:80", "/"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.header("location"), Some("https://unknown.example.com/"));
        println!("  ✓ Unrouted host redirected");

        assert_eq!(backend.requests(), 0, "redirect listener must never proxy");
        Ok(())
    }
}

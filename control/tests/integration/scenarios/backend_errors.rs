//! Backend failures map to gateway statuses
//!
//! - Backend refusing connections: 502
//! - Service gone from the cluster: 503

use crate::integration::framework::backend::EchoBackend;
use crate::integration::framework::certs::self_signed;
use crate::integration::framework::client::{https_request, TestRequest};
use crate::integration::framework::resources::{loopback_service, Ingress, TEST_NAMESPACE};
use crate::integration::{TestContext, TestResult, TestScenario};
use async_trait::async_trait;
use hyper::StatusCode;
use tokio::net::TcpListener;

pub struct BackendErrorsTest;

#[async_trait]
impl TestScenario for BackendErrorsTest {
    fn name(&self) -> &str {
        "backend_errors"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        let backend = EchoBackend::start().await?;
        let cert = self_signed(&["svc.example.com"]);

        // Reserve a port, then close it so connections are refused
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };

        ctx.cluster
            .set_service(TEST_NAMESPACE, "my-service", loopback_service(backend.port()));
        ctx.cluster
            .set_service(TEST_NAMESPACE, "dead-service", loopback_service(closed_port));
        ctx.cluster.set_secret(TEST_NAMESPACE, "my-tls", cert.secret.clone());
        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/dead", "dead-service", closed_port)
                .route("svc.example.com", "/", "my-service", backend.port())
                .tls(&["svc.example.com"], "my-tls")
                .build(),
        );
        ctx.wait_for_table("routes", |snapshot| {
            snapshot
                .match_route("svc.example.com", "/dead")
                .map(|route| route.backend.service == "dead-service")
                .unwrap_or(false)
                && snapshot.certificate_for("svc.example.com").is_some()
        })
        .await?;

        let response = https_request(
            ctx.https_addr,
            &cert.cert_pem,
            TestRequest::get("svc.example.com", "/dead"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert!(response.header("x-request-id").is_some());
        println!("  ✓ Refused connection returns 502");

        let response = https_request(
            ctx.https_addr,
            &cert.cert_pem,
            TestRequest::get("svc.example.com", "/"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::OK);

        // Services are not watched; the route stays until the next reconcile
        ctx.cluster.remove_service(TEST_NAMESPACE, "my-service");
        let response = https_request(
            ctx.https_addr,
            &cert.cert_pem,
            TestRequest::get("svc.example.com", "/"),
            ctx.timeouts.request,
        )
        .await?;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(backend.requests(), 1);
        println!("  ✓ Missing service returns 503");

        Ok(())
    }
}

//! Routing changes take effect without a restart
//!
//! Backends are swapped, resources leave the class and are deleted while
//! the listeners keep serving.

use crate::integration::framework::backend::{echoed, EchoBackend};
use crate::integration::framework::certs::self_signed;
use crate::integration::framework::client::{
    https_request, tls_connect, ClientError, TestRequest, TestResponse,
};
use crate::integration::framework::resources::{key, loopback_service, Ingress, TEST_NAMESPACE};
use crate::integration::{TestContext, TestResult, TestScenario};
use async_trait::async_trait;
use hyper::StatusCode;

pub struct LiveUpdatesTest;

#[async_trait]
impl TestScenario for LiveUpdatesTest {
    fn name(&self) -> &str {
        "live_updates"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        let blue = EchoBackend::start().await?;
        let green = EchoBackend::start().await?;
        let cert = self_signed(&["svc.example.com"]);

        ctx.cluster
            .set_service(TEST_NAMESPACE, "blue", loopback_service(blue.port()));
        ctx.cluster
            .set_service(TEST_NAMESPACE, "green", loopback_service(green.port()));
        ctx.cluster.set_secret(TEST_NAMESPACE, "my-tls", cert.secret.clone());

        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/", "blue", blue.port())
                .tls(&["svc.example.com"], "my-tls")
                .build(),
        );
        ctx.wait_for_table("blue route", |snapshot| {
            routed_to(snapshot, "/", "blue")
                && snapshot.certificate_for("svc.example.com").is_some()
        })
        .await?;
        let response = get(ctx, &cert.cert_pem, "/").await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(blue.requests(), 1);
        println!("  ✓ Serving blue");

        ctx.cluster.apply_resource(
            Ingress::new("web")
                .route("svc.example.com", "/", "green", green.port())
                .route("svc.example.com", "/legacy", "blue", blue.port())
                .tls(&["svc.example.com"], "my-tls")
                .build(),
        );
        ctx.wait_for_table("green route", |snapshot| routed_to(snapshot, "/", "green"))
            .await?;
        let response = get(ctx, &cert.cert_pem, "/shop").await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(echoed(&response.body, "path"), Some("/shop"));
        assert_eq!(green.requests(), 1);
        let response = get(ctx, &cert.cert_pem, "/legacy/page").await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(blue.requests(), 2);
        println!("  ✓ Switched to green, legacy path still on blue");

        // Another resource adds a path for the same host
        ctx.cluster.apply_resource(
            Ingress::new("admin")
                .route("svc.example.com", "/admin", "blue", blue.port())
                .build(),
        );
        ctx.wait_for_table("admin route", |snapshot| routed_to(snapshot, "/admin", "blue"))
            .await?;
        let response = get(ctx, &cert.cert_pem, "/admin").await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(blue.requests(), 3);
        println!("  ✓ Second resource merged into the host");

        // Leaving the class removes the resource's routes
        ctx.cluster.apply_resource(
            Ingress::new("admin")
                .class("other")
                .route("svc.example.com", "/admin", "blue", blue.port())
                .build(),
        );
        ctx.wait_for_table("admin route removed", |snapshot| {
            routed_to(snapshot, "/admin", "green")
        })
        .await?;
        println!("  ✓ Resource outside the class ignored");

        assert!(ctx.cluster.delete_resource(&key("web")));
        ctx.wait_for_table("routes removed", |snapshot| {
            snapshot.routes().is_empty() && snapshot.certificate_for("svc.example.com").is_none()
        })
        .await?;
        let result = tls_connect(
            ctx.https_addr,
            &cert.cert_pem,
            "svc.example.com",
            ctx.timeouts.request,
        )
        .await;
        assert!(result.is_err(), "certificate must go with its resource");
        println!("  ✓ Deleted resource no longer served");

        Ok(())
    }
}

fn routed_to(
    snapshot: &portico::proxy::router::RoutingTableSnapshot,
    path: &str,
    service: &str,
) -> bool {
    snapshot
        .match_route("svc.example.com", path)
        .map(|route| route.backend.service == service)
        .unwrap_or(false)
}

async fn get(ctx: &TestContext, cert_pem: &str, path: &str) -> Result<TestResponse, ClientError> {
    https_request(
        ctx.https_addr,
        cert_pem,
        TestRequest::get("svc.example.com", path),
        ctx.timeouts.request,
    )
    .await
}

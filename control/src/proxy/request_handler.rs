//! HTTP Request Handlers
//!
//! - HTTPS listener: route by host and path, resolve the backend, forward
//! - HTTP listener: redirect everything to HTTPS, never proxy
//! - Metrics listener: Prometheus text exposition

use crate::error::ProxyError;
use crate::proxy::backends::BackendResolver;
use crate::proxy::forwarder::{
    forward_to_backend, BackendClient, ForwardRequest, ProxyBody, X_REQUEST_ID,
};
use crate::proxy::metrics::{encode_metrics, metrics_content_type, record_request};
use crate::proxy::router::RoutingTable;
use common::normalize_host;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default port of the public HTTPS endpoint, omitted from redirects
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Everything the HTTPS handler needs, shared by all connections
pub struct ProxyContext {
    pub table: Arc<RoutingTable>,
    pub resolver: Arc<BackendResolver>,
    pub client: BackendClient,
    pub rewrite_host: bool,
    pub request_timeout: Duration,
}

/// Request host from the Host header, else the URI authority (normalized)
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(normalize_host)
        .or_else(|| req.uri().host().map(normalize_host))
        .filter(|host| !host.is_empty())
}

fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Handle a request terminated on the TLS listener
pub async fn handle_https_request(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, String> {
    let start = Instant::now();
    let request_id = request_id(&req);
    let path = req.uri().path().to_string();

    info!(
        request_id = %request_id,
        stage = "request_received",
        http.request.method = %req.method(),
        url.path = %path,
        client.address = %client_addr,
        "Incoming HTTPS request"
    );

    let response = route_and_forward(req, &context, client_addr, &request_id, &path)
        .await
        .unwrap_or_else(|local| local);

    let status = response.status().as_u16();
    record_request("https", status, start.elapsed().as_secs_f64());
    info!(
        request_id = %request_id,
        stage = "request_complete",
        http.response.status_code = status,
        timing.total_us = start.elapsed().as_micros() as u64,
        "Request complete"
    );
    Ok(response)
}

/// Both arms carry a finished response; `Err` marks a locally generated one
async fn route_and_forward(
    req: Request<Incoming>,
    context: &ProxyContext,
    client_addr: SocketAddr,
    request_id: &str,
    path: &str,
) -> Result<Response<ProxyBody>, Response<ProxyBody>> {
    let Some(host) = request_host(&req) else {
        debug!(request_id = %request_id, "Request without host");
        return Err(build_error_response(StatusCode::BAD_REQUEST, "Missing Host header", request_id));
    };

    // Hold one snapshot for the whole request
    let snapshot = context.table.current();
    let Some(route) = snapshot.match_route(&host, path) else {
        debug!(request_id = %request_id, host = %host, url.path = %path, "No matching route");
        return Err(build_error_response(StatusCode::NOT_FOUND, "Not Found", request_id));
    };
    let backend = route.backend.clone();
    debug!(
        request_id = %request_id,
        host = %host,
        route.host = %route.host,
        route.path = %route.path,
        backend = %backend,
        "Matched route"
    );

    let backend_addr = match context.resolver.resolve(&backend).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!(request_id = %request_id, backend = %backend, error = %e, "Backend unavailable");
            return Err(build_error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable",
                request_id,
            ));
        }
    };

    let params = ForwardRequest {
        request_id,
        client_addr,
        host: &host,
        backend: backend_addr,
        rewrite_host: context.rewrite_host,
        timeout: context.request_timeout,
    };
    forward_to_backend(req, &context.client, &params)
        .await
        .map_err(|e| error_to_response(&e, request_id))
}

/// Handle a plaintext request: permanent redirect to the HTTPS endpoint
///
/// GET and HEAD get 301; other methods get 308 so clients keep the method
/// and body.
pub async fn handle_redirect_request<B>(
    req: Request<B>,
    public_https_port: u16,
) -> Result<Response<ProxyBody>, String> {
    let start = Instant::now();
    let response = build_redirect_response(&req, public_https_port);
    record_request("http", response.status().as_u16(), start.elapsed().as_secs_f64());
    Ok(response)
}

pub fn build_redirect_response<B>(req: &Request<B>, public_https_port: u16) -> Response<ProxyBody> {
    let Some(host) = request_host(req) else {
        return build_error_response(StatusCode::BAD_REQUEST, "Missing Host header", "");
    };

    let port = if public_https_port == DEFAULT_HTTPS_PORT {
        String::new()
    } else {
        format!(":{}", public_https_port)
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}{}", host, port, path_and_query);

    let status = if *req.method() == Method::GET || *req.method() == Method::HEAD {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::PERMANENT_REDIRECT
    };

    let Ok(location_value) = HeaderValue::from_str(&location) else {
        return build_error_response(StatusCode::BAD_REQUEST, "Invalid redirect target", "");
    };
    debug!(status = status.as_u16(), location = %location, "Redirecting to HTTPS");

    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(LOCATION, location_value);
    response
}

/// Serve the /metrics endpoint
pub async fn handle_metrics_request<B>(req: Request<B>) -> Result<Response<ProxyBody>, String> {
    if req.uri().path() != "/metrics" || *req.method() != Method::GET {
        return Ok(build_error_response(StatusCode::NOT_FOUND, "Not Found", ""));
    }

    match encode_metrics() {
        Ok(buffer) => {
            let mut response = Response::new(
                Full::new(Bytes::from(buffer))
                    .map_err(|never| match never {})
                    .boxed(),
            );
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static(metrics_content_type()),
            );
            Ok(response)
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            Ok(build_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
                "",
            ))
        }
    }
}

/// Map a forwarding failure to the client-facing status
fn error_to_response(error: &ProxyError, request_id: &str) -> Response<ProxyBody> {
    match error {
        ProxyError::UpstreamTimeout(_) => {
            build_error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout", request_id)
        }
        ProxyError::BackendUnavailable(_) => {
            build_error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable", request_id)
        }
        ProxyError::Upstream(_) | ProxyError::InvalidRequest(_) => {
            build_error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", request_id)
        }
    }
}

/// Build a plain-text error response
fn build_error_response(status: StatusCode, message: &'static str, request_id: &str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(message.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        if !request_id.is_empty() {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    response
}

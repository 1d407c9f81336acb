//! Backend Request Forwarding
//!
//! Streams a terminated HTTPS request to its backend over plain HTTP/1.1 and
//! streams the response back. Hop-by-hop headers are stripped in both
//! directions and the usual X-Forwarded-* headers are appended.

use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Pooled HTTP/1.1 client used for every backend
pub type BackendClient = Client<HttpConnector, ProxyBody>;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Check if a header is hop-by-hop and should not be forwarded
/// Per RFC 7230 Section 6.1
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including any the Connection header names
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

pub fn build_client(connect_timeout: Duration) -> BackendClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Per-request forwarding parameters
#[derive(Debug, Clone)]
pub struct ForwardRequest<'a> {
    pub request_id: &'a str,
    pub client_addr: SocketAddr,
    /// Normalized request host
    pub host: &'a str,
    pub backend: SocketAddr,
    /// Replace the Host header with the backend address
    pub rewrite_host: bool,
    /// Upper bound on waiting for the backend's response headers
    pub timeout: Duration,
}

/// Forward request to backend server
pub async fn forward_to_backend(
    req: Request<Incoming>,
    client: &BackendClient,
    params: &ForwardRequest<'_>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    // SocketAddr::Display brackets IPv6 addresses
    let backend_uri: Uri = format!("http://{}{}", params.backend, path_and_query)
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid backend URI: {}", e)))?;

    strip_hop_by_hop_headers(&mut parts.headers);
    append_forwarding_headers(&mut parts.headers, params)?;
    if params.rewrite_host || !parts.headers.contains_key(HOST) {
        let value = if params.rewrite_host {
            params.backend.to_string()
        } else {
            params.host.to_string()
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid host header: {}", e)))?;
        parts.headers.insert(HOST, value);
    }

    parts.uri = backend_uri;
    parts.version = hyper::Version::HTTP_11;
    let method = parts.method.clone();
    let backend_req = Request::from_parts(parts, body.boxed());

    debug!(
        request_id = %params.request_id,
        network.peer.address = %params.backend,
        http.request.method = %method,
        url.path = %path_and_query,
        "Sending request to backend"
    );

    let backend_resp = match tokio::time::timeout(params.timeout, client.request(backend_req)).await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(
                request_id = %params.request_id,
                error.message = %e,
                error.type = "backend_connection",
                network.peer.address = %params.backend,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Backend request failed"
            );
            return Err(ProxyError::Upstream(e.to_string()));
        }
        Err(_elapsed) => {
            warn!(
                request_id = %params.request_id,
                timeout_ms = params.timeout.as_millis() as u64,
                network.peer.address = %params.backend,
                "Backend request timeout exceeded"
            );
            return Err(ProxyError::UpstreamTimeout(params.timeout));
        }
    };

    let (mut parts, body) = backend_resp.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    if let Ok(value) = HeaderValue::from_str(params.request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }

    info!(
        request_id = %params.request_id,
        stage = "backend_response_received",
        http.response.status_code = parts.status.as_u16(),
        network.peer.address = %params.backend,
        elapsed_us = started.elapsed().as_micros() as u64,
        "Backend responded"
    );

    Ok(Response::from_parts(parts, body.boxed()))
}

fn append_forwarding_headers(
    headers: &mut HeaderMap,
    params: &ForwardRequest<'_>,
) -> Result<(), ProxyError> {
    let client_ip = params.client_addr.ip().to_string();
    let forwarded_for = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };

    let invalid = |e: hyper::header::InvalidHeaderValue| {
        ProxyError::InvalidRequest(format!("invalid forwarding header: {}", e))
    };
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&forwarded_for).map_err(invalid)?,
    );
    headers.insert(
        X_FORWARDED_HOST,
        HeaderValue::from_str(params.host).map_err(invalid)?,
    );
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
    headers.insert(
        X_REQUEST_ID,
        HeaderValue::from_str(params.request_id).map_err(invalid)?,
    );
    Ok(())
}

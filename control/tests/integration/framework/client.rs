//! Minimal HTTP and HTTPS clients
//!
//! One connection per request. The HTTPS client trusts only the
//! certificate it is given and sends the requested host as SNI, so a
//! handshake succeeds only when the proxy serves a matching certificate.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// What came back from the proxy
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Request to send, addressed by Host rather than by socket
pub struct TestRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub body: Option<String>,
}

impl TestRequest {
    pub fn get(host: &str, path: &str) -> Self {
        Self {
            method: Method::GET,
            host: host.to_string(),
            path: path.to_string(),
            body: None,
        }
    }

    pub fn post(host: &str, path: &str, body: &str) -> Self {
        Self {
            method: Method::POST,
            host: host.to_string(),
            path: path.to_string(),
            body: Some(body.to_string()),
        }
    }
}

/// Send `request` in plaintext to `addr`
pub async fn http_request(
    addr: SocketAddr,
    request: TestRequest,
    timeout: Duration,
) -> Result<TestResponse, ClientError> {
    let stream = TcpStream::connect(addr).await?;
    tokio::time::timeout(timeout, send(stream, request))
        .await
        .map_err(|_| "HTTP request timed out")?
}

/// Send `request` over TLS to `addr`, with SNI set to the request host
pub async fn https_request(
    addr: SocketAddr,
    trusted_cert_pem: &str,
    request: TestRequest,
    timeout: Duration,
) -> Result<TestResponse, ClientError> {
    let stream = tls_connect(addr, trusted_cert_pem, &request.host, timeout).await?;
    tokio::time::timeout(timeout, send(stream, request))
        .await
        .map_err(|_| "HTTPS request timed out")?
}

/// Open a TLS session to `addr` presenting `sni` as server name
pub async fn tls_connect(
    addr: SocketAddr,
    trusted_cert_pem: &str,
    sni: &str,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ClientError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut trusted_cert_pem.as_bytes()) {
        roots.add(cert?)?;
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(sni.to_string())?;
    let stream = TcpStream::connect(addr).await?;
    let tls = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| "TLS handshake timed out")??;
    Ok(tls)
}

async fn send<I>(io: I, request: TestRequest) -> Result<TestResponse, ClientError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let body = request.body.unwrap_or_default();
    let req = Request::builder()
        .method(request.method)
        .uri(request.path)
        .header("host", request.host)
        .body(Full::new(Bytes::from(body)))?;

    let response = sender.send_request(req).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await?.to_bytes();

    Ok(TestResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

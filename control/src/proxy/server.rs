//! Listeners
//!
//! - HTTP: every request is answered with a redirect to HTTPS
//! - HTTPS: TLS terminated with the snapshot certificate resolver, requests
//!   routed and forwarded
//! - Metrics (optional): Prometheus scrape endpoint
//!
//! On shutdown the listeners stop accepting, open connections are asked to
//! finish their current request, and whatever remains after the grace period
//! is dropped.

use crate::config::ControllerConfig;
use crate::error::{PorticoError, TlsError};
use crate::proxy::forwarder::ProxyBody;
use crate::proxy::request_handler::{
    handle_https_request, handle_metrics_request, handle_redirect_request, ProxyContext,
};
use crate::proxy::tls::build_server_config;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on a client completing the TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bound sockets, created before serving so bind errors surface early
pub struct Listeners {
    pub http: TcpListener,
    pub https: TcpListener,
    pub metrics: Option<TcpListener>,
}

impl Listeners {
    pub async fn bind(config: &ControllerConfig) -> Result<Self, PorticoError> {
        let http = bind(&config.http_bind_addr).await?;
        let https = bind(&config.https_bind_addr).await?;
        let metrics = match &config.metrics_bind_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        Ok(Self {
            http,
            https,
            metrics,
        })
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> std::io::Result<SocketAddr> {
        self.https.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().and_then(|l| l.local_addr().ok())
    }
}

async fn bind(addr: &str) -> Result<TcpListener, PorticoError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| PorticoError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// HTTP and HTTPS front of the proxy
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    tls_acceptor: TlsAcceptor,
    public_https_port: u16,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(context: ProxyContext, config: &ControllerConfig) -> Result<Self, TlsError> {
        let tls_config = build_server_config(context.table.clone())?;
        Ok(Self {
            context: Arc::new(context),
            tls_acceptor: TlsAcceptor::from(tls_config),
            public_https_port: config.https_public_port,
            shutdown_grace: config.timeouts.shutdown_grace(),
        })
    }

    /// Serve until `shutdown` fires and connections have drained
    pub async fn serve(self, listeners: Listeners, shutdown: CancellationToken) {
        let grace = self.shutdown_grace;

        let public_port = self.public_https_port;
        let http = serve_listener(
            "http",
            listeners.http,
            shutdown.clone(),
            grace,
            move |stream, _peer, stop| {
                serve_http1(
                    stream,
                    move |req: Request<Incoming>| handle_redirect_request(req, public_port),
                    stop,
                )
            },
        );

        let context = self.context.clone();
        let acceptor = self.tls_acceptor.clone();
        let https = serve_listener(
            "https",
            listeners.https,
            shutdown.clone(),
            grace,
            move |stream, peer, stop| {
                let context = context.clone();
                let acceptor = acceptor.clone();
                async move {
                    let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
                    let tls_stream = match handshake.await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(e)) => {
                            debug!(client.address = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            debug!(client.address = %peer, "TLS handshake timed out");
                            return;
                        }
                    };
                    serve_http1(
                        tls_stream,
                        move |req: Request<Incoming>| handle_https_request(req, context.clone(), peer),
                        stop,
                    )
                    .await;
                }
            },
        );

        let metrics_listener = listeners.metrics;
        let metrics = async move {
            if let Some(listener) = metrics_listener {
                serve_listener("metrics", listener, shutdown, grace, |stream, _peer, stop| {
                    serve_http1(stream, handle_metrics_request::<Incoming>, stop)
                })
                .await;
            }
        };

        tokio::join!(http, https, metrics);
        info!("Proxy listeners stopped");
    }
}

/// Accept loop shared by all listeners
///
/// `on_connection` builds the future serving one accepted connection; it
/// receives the shutdown token so the connection can finish gracefully.
async fn serve_listener<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    shutdown: CancellationToken,
    grace: Duration,
    on_connection: F,
) where
    F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!(listener = name, address = %local, "Listener started");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = name, client.address = %peer, "Accepted connection");
                    let _ = stream.set_nodelay(true);
                    connections.spawn(on_connection(stream, peer, shutdown.clone()));
                }
                Err(e) => {
                    error!(listener = name, error = %e, "Accept error");
                    if !pause_after_accept_error(&shutdown).await {
                        break;
                    }
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(listener = name, error = %e, "Connection task failed");
                }
            }
        }
    }

    drop(listener);
    let open = connections.len();
    if open > 0 {
        info!(listener = name, open, "Draining open connections");
    }
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            listener = name,
            remaining = connections.len(),
            "Shutdown grace period elapsed, dropping connections"
        );
        connections.abort_all();
    }
    info!(listener = name, "Listener stopped");
}

/// Returns false when shutdown is requested during the pause
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Serve HTTP/1.1 on `io` until the client is done or shutdown is requested
async fn serve_http1<I, S, Fut>(io: I, handler: S, shutdown: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response<ProxyBody>, String>> + Send + 'static,
{
    let service = service_fn(handler);
    let connection = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "Connection error");
    }
}

use anyhow::{Context, Result};
use portico::apis::cluster::ClusterApi;
use portico::apis::ingress::ingress::KubeClusterApi;
use portico::config::ControllerConfig;
use portico::controller::IngressController;
use portico::proxy::backends::BackendResolver;
use portico::proxy::forwarder::build_client;
use portico::proxy::request_handler::ProxyContext;
use portico::proxy::router::RoutingTable;
use portico::proxy::server::{Listeners, ProxyServer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Needed by both the kube client and the TLS listener
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::from_env().context("invalid configuration")?;
    info!(
        ingress_class = %config.ingress_class,
        workers = config.workers,
        http = %config.http_bind_addr,
        https = %config.https_bind_addr,
        "Starting portico"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client));
    let table = Arc::new(RoutingTable::new());

    let listeners = Listeners::bind(&config).await?;
    let resolver = Arc::new(BackendResolver::new(
        api.clone(),
        config.service_cache_ttl(),
        config.timeouts.api_timeout(),
    ));
    let context = ProxyContext {
        table: table.clone(),
        resolver,
        client: build_client(config.timeouts.connect_timeout()),
        rewrite_host: config.rewrite_host,
        request_timeout: config.timeouts.request_timeout(),
    };
    let server = ProxyServer::new(context, &config)?;
    let controller = IngressController::new(api, table, &config);

    let shutdown = CancellationToken::new();
    let mut controller_task = tokio::spawn(controller.run(shutdown.clone()));
    let server_task = tokio::spawn(server.serve(listeners, shutdown.clone()));

    // The controller only returns on its own when its watch is gone
    let controller_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            shutdown.cancel();
            controller_task.await
        }
        result = &mut controller_task => {
            shutdown.cancel();
            result
        }
    };

    if let Err(e) = server_task.await {
        error!(error = %e, "Proxy server task failed");
    }

    match controller_result {
        Ok(Ok(())) => {
            info!("Portico stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("ingress controller stopped"),
        Err(e) => Err(e).context("ingress controller task failed"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

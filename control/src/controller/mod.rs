//! Ingress controller
//!
//! Watch notifications feed the reconcile queue; a fixed worker pool drains
//! it through the reconciler, which republishes the routing table.

pub mod queue;
pub mod reconciler;
pub mod worker;

use crate::apis::cluster::ClusterApi;
use crate::apis::metrics::record_watch_event;
use crate::config::ControllerConfig;
use crate::error::ClusterError;
use crate::proxy::router::RoutingTable;
use futures::StreamExt;
use queue::{ErrorReporter, LogErrorReporter, ReconcileQueue, RetryPolicy};
use reconciler::Reconciler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::WorkerPool;

pub struct IngressController {
    api: Arc<dyn ClusterApi>,
    queue: ReconcileQueue,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl IngressController {
    pub fn new(api: Arc<dyn ClusterApi>, table: Arc<RoutingTable>, config: &ControllerConfig) -> Self {
        Self::with_reporter(api, table, config, Arc::new(LogErrorReporter))
    }

    pub fn with_reporter(
        api: Arc<dyn ClusterApi>,
        table: Arc<RoutingTable>,
        config: &ControllerConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let queue = ReconcileQueue::with_reporter(RetryPolicy::from(&config.retry), reporter);
        let reconciler = Arc::new(Reconciler::new(api.clone(), table, config));
        Self {
            api,
            queue,
            reconciler,
            workers: config.workers,
        }
    }

    pub fn queue(&self) -> &ReconcileQueue {
        &self.queue
    }

    /// Watch and reconcile until `shutdown` fires
    ///
    /// In-flight reconciliations finish before this returns. A watch stream
    /// that ends on its own is reported as `WatchClosed`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClusterError> {
        let pool = WorkerPool::start(self.queue.clone(), self.reconciler.clone(), self.workers);
        let mut events = self.api.watch_routing_resources();
        info!(workers = pool.size(), "Ingress controller running");

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Ingress controller shutting down");
                    break Ok(());
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        record_watch_event(event.kind.as_str());
                        self.queue.enqueue(event.kind, event.key);
                    }
                    // The watcher recovers on its own; keep consuming
                    Some(Err(e)) => warn!(error = %e, "Watch error"),
                    None => {
                        warn!("Watch stream ended");
                        break Err(ClusterError::WatchClosed);
                    }
                }
            }
        };

        pool.stop().await;
        result
    }
}

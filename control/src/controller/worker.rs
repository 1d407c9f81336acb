//! Worker pool
//!
//! N tasks pull keys from the reconcile queue and run a reconciliation for
//! each. The queue guarantees a key is never handed to two workers at once.

use crate::controller::queue::{Event, ReconcileQueue};
use crate::error::ReconcileError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something that converges cluster state for one event
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, event: &Event) -> Result<(), ReconcileError>;
}

pub struct WorkerPool {
    queue: ReconcileQueue,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one) draining `queue`
    pub fn start(queue: ReconcileQueue, reconciler: Arc<dyn Reconcile>, workers: usize) -> Self {
        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|id| {
                let queue = queue.clone();
                let reconciler = reconciler.clone();
                tokio::spawn(run_worker(id, queue, reconciler))
            })
            .collect();

        info!(workers, "Started reconcile workers");
        Self { queue, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Shut the queue down and wait until every worker has exited
    pub async fn stop(self) {
        self.queue.shutdown();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconcile worker exited abnormally");
            }
        }
        info!("All reconcile workers stopped");
    }
}

async fn run_worker(id: usize, queue: ReconcileQueue, reconciler: Arc<dyn Reconcile>) {
    debug!(worker = id, "Reconcile worker started");

    while let Some(item) = queue.dequeue().await {
        let started = Instant::now();
        let result = reconciler.reconcile(&item.event).await;
        debug!(
            worker = id,
            key = %item.event.key,
            kind = %item.event.kind,
            attempt = item.event.attempt,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed work item"
        );
        item.complete(result);
    }

    debug!(worker = id, "Reconcile worker exiting");
}

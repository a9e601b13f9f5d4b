use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterEvent, ObjectClient, ObjectStore};
use crate::metrics::record_reconcile;
use crate::queue::WorkQueue;
use crate::utils::split_key;
use crate::{Error, Result};

pub mod canary;
pub mod core;
pub mod gamedeployment;
pub mod scale;
pub mod status;
pub mod update;
pub mod util;

pub use gamedeployment::{GameDeploymentController, DEFAULT_EXPECTATION_TIMEOUT};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of keys reconciled concurrently.
    pub workers: usize,
    /// How long to wait on unobserved creates, deletes and updates before warning.
    pub expectation_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            expectation_timeout: DEFAULT_EXPECTATION_TIMEOUT,
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Feeds cluster events through the work queue to a pool of workers.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    #[derivative(Debug = "ignore")]
    reconciler: GameDeploymentController,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn ObjectClient>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: GameDeploymentController::new(store, client, config.expectation_timeout),
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    pub fn reconciler(&self) -> &GameDeploymentController {
        &self.reconciler
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn handle_event(&self, event: &ClusterEvent) {
        for key in self.reconciler.handle_event(event) {
            self.queue.add(&key);
        }
    }

    /// Take the next key off the queue and reconcile it. Returns false once the queue has shut
    /// down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let start = Instant::now();
        let result = AssertUnwindSafe(self.reconciler.sync(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic))));
        self.finish(&key, result, start.elapsed());
        true
    }

    fn finish(&self, key: &str, result: Result<Option<Duration>>, elapsed: Duration) {
        if let Ok((namespace, name)) = split_key(key) {
            record_reconcile(namespace, name, result.is_ok(), elapsed);
        }
        match result {
            Ok(requeue) => {
                debug!(key, ?elapsed, "Finished syncing");
                self.queue.forget(key);
                if let Some(delay) = requeue {
                    self.queue.add_after(key, delay);
                }
            }
            Err(Error::InvalidKey(_)) => {
                error!(key, "Dropping invalid key");
                self.queue.forget(key);
            }
            Err(error) => {
                warn!(
                    key,
                    %error,
                    requeues = self.queue.num_requeues(key),
                    "Sync failed, requeueing"
                );
                self.queue.add_rate_limited(key);
            }
        }
        self.queue.done(key);
    }

    /// Run until `shutdown` turns true, then drain the workers.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(workers = self.config.workers, "Starting controller");
        let pump = {
            let controller = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    controller.handle_event(&event);
                }
                debug!("Event stream closed");
            })
        };

        let workers = (0..self.config.workers.max(1))
            .map(|id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move {
                    debug!(id, "Worker started");
                    while controller.process_next().await {}
                    debug!(id, "Worker stopped");
                })
            })
            .collect::<Vec<_>>();

        // a dropped sender also stops the controller
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Shutting down controller");
        self.queue.shut_down();
        pump.abort();
        for result in futures::future::join_all(workers).await {
            if let Err(error) = result {
                warn!(%error, "Worker task failed");
            }
        }
        info!("Controller stopped");
    }
}

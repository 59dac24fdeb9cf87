//! Partition ownership.
//!
//! A consumer that owns a partition keeps renewing its lease in the
//! background for as long as its stream is alive, including while a batch it
//! yielded is still being processed. Batches carry a [`Lease`] handle so the
//! processor can see when ownership was lost and stop before rerouting or
//! committing anything.

use crate::error::QueueError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Whether the consumer that read a batch still owns its partition
#[derive(Debug, Clone)]
pub struct Lease {
    held: watch::Receiver<bool>,
}

impl Lease {
    /// Follow an ownership flag maintained elsewhere.
    pub fn from_watch(held: watch::Receiver<bool>) -> Self {
        Self { held }
    }

    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }
}

/// Background renewal of a held lease.
///
/// Ownership is given up when `renew` reports the lease belongs to someone
/// else, or when renewals keep failing for a whole TTL. Dropping the
/// heartbeat stops renewing and marks the lease released.
pub(crate) struct Heartbeat {
    held: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn spawn<F, Fut>(interval: Duration, ttl: Duration, mut renew: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool, QueueError>> + Send + 'static,
    {
        let (held, _) = watch::channel(true);
        let held = Arc::new(held);
        let flag = held.clone();

        let task = tokio::spawn(async move {
            let mut renewed_at = Instant::now();
            loop {
                tokio::time::sleep(interval).await;
                match renew().await {
                    Ok(true) => renewed_at = Instant::now(),
                    Ok(false) => {
                        warn!("Partition lease taken over by another consumer");
                        break;
                    }
                    Err(e) if renewed_at.elapsed() < ttl => {
                        warn!(error = %e, "Lease renewal failed, retrying");
                    }
                    Err(e) => {
                        warn!(error = %e, "Lease expired while renewals kept failing");
                        break;
                    }
                }
            }
            flag.send_replace(false);
        });

        Self { held, task }
    }

    pub(crate) fn lease(&self) -> Lease {
        Lease::from_watch(self.held.subscribe())
    }

    pub(crate) fn is_held(&self) -> bool {
        *self.held.borrow()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
        self.held.send_replace(false);
    }
}

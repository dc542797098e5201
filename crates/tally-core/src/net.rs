use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide gate for outbound remote calls. Every listing, object read
/// and metadata query passes through here; the capacity cap is the only
/// backpressure mechanism in the pipeline.
#[derive(Clone)]
pub struct NetGate {
    sem: Arc<Semaphore>,
}

impl NetGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Acquires a permit, runs the future, and releases the permit when the
    /// future completes, on the error path included.
    pub async fn with<T>(&self, fut: impl Future<Output = T>) -> anyhow::Result<T> {
        let _permit = self.sem.clone().acquire_owned().await?;
        Ok(fut.await)
    }

    /// Owned permit for callers that need to hold the slot across a scope
    /// rather than a single future.
    pub async fn acquire(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Ok(self.sem.clone().acquire_owned().await?)
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

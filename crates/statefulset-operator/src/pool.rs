//! Bounded worker pool for API calls kept off the reconcile task.

use crate::error::OperatorError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

/// Runs jobs on spawned tasks, at most `size` at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool; a size of zero is treated as one.
    #[must_use]
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: Arc::from(name),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of concurrent jobs.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of job slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on the pool and wait for its result.
    ///
    /// A panicking job is reported as [`OperatorError::WorkerPool`].
    pub async fn execute<F, T>(&self, job: F) -> Result<T, OperatorError>
    where
        F: Future<Output = Result<T, OperatorError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| OperatorError::WorkerPool(format!("{}: {}", self.name, e)))?;
        trace!("Dispatching job to worker pool {}", self.name);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            job.await
        });

        handle
            .await
            .map_err(|e| OperatorError::WorkerPool(format!("{}: {}", self.name, e)))?
    }
}

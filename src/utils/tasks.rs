//! Bounded background task pool for document processing and post-turn side
//! effects. Scheduling happens strictly after the scheduling site's
//! transaction has committed, so a queued task never observes uncommitted
//! rows. Tasks queue on the semaphore when the pool is saturated, which is
//! how excess uploads simply stay PENDING until a slot frees up.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Number of tasks that could start immediately.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn a named unit of work onto the pool. The future starts only once
    /// a permit is available; errors are logged, never propagated (the
    /// scheduling site has already answered its caller).
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return, // pool shut down
            };
            debug!(task = name, "background task started");
            if let Err(e) = fut.await {
                error!(task = name, error = %e, "background task failed");
            } else {
                debug!(task = name, "background task finished");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_spawned_task() {
        let pool = TaskPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.spawn("unit", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saturated_pool_queues_tasks() {
        let pool = TaskPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let slow = counter.clone();
        pool.spawn("slow", async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            slow.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let queued = counter.clone();
        pool.spawn("queued", async move {
            queued.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // The queued task waits for the slow one's permit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}

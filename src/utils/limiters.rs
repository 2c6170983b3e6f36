use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;

/// Named concurrency limiters for outbound work. Excess callers queue on the
/// semaphore and fail after `acquire_timeout` instead of piling up.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub search: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            search: Arc::new(Semaphore::new(cfg.search_concurrency.max(1))),
            llm: Arc::new(Semaphore::new(cfg.llm_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_within_capacity() {
        let sem = Arc::new(Semaphore::new(2));
        let (permit, wait) =
            Limiters::acquire_timed(sem, Duration::from_millis(100), "test")
                .await
                .unwrap();
        assert!(wait < Duration::from_millis(100));
        drop(permit);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let sem = Arc::new(Semaphore::new(1));
        let _held = sem.clone().acquire_owned().await.unwrap();
        let result =
            Limiters::acquire_timed(sem, Duration::from_millis(20), "test").await;
        assert!(result.is_err());
    }
}

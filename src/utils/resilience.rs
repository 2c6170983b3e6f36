//! Retry / timeout / circuit-breaker wrapper for outbound dependencies.
//!
//! Every embedding, chat and reranker call goes through [`Guard::call`].
//! When the breaker is open the call fails immediately with
//! [`CallError::BreakerOpen`]; the caller invokes its named fallback (empty
//! embedding, pass-through rerank, original query).

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: &'static str,
    pub retries: u32,
    pub timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Policy {
    pub fn new(name: &'static str, retries: u32, timeout: Duration) -> Self {
        Self {
            name,
            retries,
            timeout,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("circuit breaker open for {0}")]
    BreakerOpen(&'static str),

    #[error("{name} timed out after {timeout:?}")]
    Timeout {
        name: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// One guard instance per outbound dependency, shared across calls.
pub struct Guard {
    policy: Policy,
    state: Mutex<BreakerState>,
}

impl Guard {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.policy.name
    }

    fn check_open(&self) -> bool {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed; half-open, let one attempt through.
                state.open_until = None;
                false
            }
            None => false,
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.policy.breaker_threshold {
            state.open_until = Some(Instant::now() + self.policy.breaker_cooldown);
            warn!(
                breaker = self.policy.name,
                failures = state.consecutive_failures,
                cooldown_secs = self.policy.breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    /// Run `op` under the policy: per-attempt timeout, bounded retries with
    /// linear backoff, breaker accounting. `op` is a factory producing a
    /// fresh future per attempt.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.check_open() {
            return Err(CallError::BreakerOpen(self.policy.name));
        }

        let attempts = self.policy.retries + 1;
        let mut last_err: Option<CallError> = None;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(self.policy.timeout, op()).await;
            match result {
                Ok(Ok(value)) => {
                    self.record_success();
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    debug!(
                        dep = self.policy.name,
                        attempt,
                        error = %e,
                        "call attempt failed"
                    );
                    last_err = Some(CallError::Inner(e));
                }
                Err(_) => {
                    debug!(dep = self.policy.name, attempt, "call attempt timed out");
                    last_err = Some(CallError::Timeout {
                        name: self.policy.name,
                        timeout: self.policy.timeout,
                    });
                }
            }

            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
        }

        self.record_failure();
        Err(last_err.unwrap_or(CallError::BreakerOpen(self.policy.name)))
    }
}

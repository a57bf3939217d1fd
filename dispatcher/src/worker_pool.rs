//! Bounded attestor-invocation worker pool, per-task deadline, and the
//! dispatcher's rate-limit/domain/size safety rails (§4.C11 steps 4-5,
//! §5 "Scheduling model").

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub task_deadline: Duration,
    pub max_invocations_per_minute: u32,
    pub max_request_bytes: usize,
    pub allowed_domains: Option<Vec<String>>,
    pub denied_domains: Vec<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            task_deadline: Duration::from_secs(60),
            max_invocations_per_minute: 100,
            max_request_bytes: 10 * 1024 * 1024,
            allowed_domains: None,
            denied_domains: Vec::new(),
        }
    }
}

type MinuteLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Caps concurrent attestor invocations at `max_workers` across all proxy
/// flows, and gates every submission through the per-minute cap and the
/// domain/size safety checks before a worker slot is even requested.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    rate_limiter: MinuteLimiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DomainDenied,
    DomainNotAllowed,
    RequestTooLarge,
    RateLimited,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            RejectReason::DomainDenied => "domain is on the deny list",
            RejectReason::DomainNotAllowed => "domain is not on the allow list",
            RejectReason::RequestTooLarge => "request exceeds the configured maximum size",
            RejectReason::RateLimited => "per-minute attestor invocation cap exceeded",
        };
        write!(f, "{msg}")
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(config.max_invocations_per_minute.max(1)).unwrap());
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            rate_limiter: RateLimiter::direct(quota),
            config,
        }
    }

    /// Pre-flight checks (§4.C11 "Rate limiting and safety") run before a
    /// worker slot is requested, so a rejected task never occupies one.
    pub fn admit(&self, host: &str, request_bytes: usize) -> Result<(), RejectReason> {
        if self.config.denied_domains.iter().any(|d| d == host) {
            return Err(RejectReason::DomainDenied);
        }
        if let Some(allowed) = &self.config.allowed_domains {
            if !allowed.iter().any(|d| d == host) {
                return Err(RejectReason::DomainNotAllowed);
            }
        }
        if request_bytes > self.config.max_request_bytes {
            return Err(RejectReason::RequestTooLarge);
        }
        if self.rate_limiter.check().is_err() {
            return Err(RejectReason::RateLimited);
        }
        Ok(())
    }

    /// Acquire a worker slot, run `task` under the configured deadline, and
    /// release the slot regardless of outcome. On timeout the slot is freed
    /// and `Err` reports `"timeout"` (§5 cancellation policy).
    pub async fn run<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let result = tokio::time::timeout(self.config.task_deadline, task()).await;
        drop(permit);

        match result {
            Ok(inner) => inner,
            Err(_) => bail!("timeout"),
        }
    }

    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_exceeded_frees_the_slot() {
        let pool = WorkerPool::new(WorkerPoolConfig { max_workers: 1, task_deadline: Duration::from_millis(20), ..Default::default() });

        let err = pool.run(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert_eq!(pool.available_workers(), 1);
    }

    #[tokio::test]
    async fn second_task_waits_for_a_free_slot() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig { max_workers: 1, task_deadline: Duration::from_secs(5), ..Default::default() }));
        let pool2 = pool.clone();

        let first = tokio::spawn(async move {
            pool2.run(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>(1)
            }).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.available_workers(), 0);

        let second = pool.run(|| async { Ok::<_, anyhow::Error>(2) }).await.unwrap();
        assert_eq!(second, 2);
        assert_eq!(first.await.unwrap().unwrap(), 1);
    }

    #[test]
    fn denied_domain_is_rejected_before_a_slot_is_requested() {
        let pool = WorkerPool::new(WorkerPoolConfig { denied_domains: vec!["evil.example".into()], ..Default::default() });
        assert_eq!(pool.admit("evil.example", 10), Err(RejectReason::DomainDenied));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pool = WorkerPool::new(WorkerPoolConfig { max_request_bytes: 10, ..Default::default() });
        assert_eq!(pool.admit("api.example.com", 11), Err(RejectReason::RequestTooLarge));
    }
}

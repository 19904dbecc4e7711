//! Circuit-broken wrapper around a `SandboxRuntime`.
//!
//! Every call into the underlying runtime passes an admission gate: at
//! most `max_concurrent` in-flight operations, with a bounded FIFO of
//! waiters behind them. Overflowing both is rejected with backpressure
//! before any I/O. Retryable failures are retried with exponential
//! backoff and jitter.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Semaphore, SemaphorePermit};

use tb_domain::{Error, Result};

use crate::runtime::{AttachedStreams, ExecOutput, SandboxRuntime, SandboxSpec};

/// Admission-gate and retry tunables.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_concurrent: usize,
    /// How many callers may wait for a permit before rejection.
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            queue_capacity: 100,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// [`SandboxRuntime`] wrapper enforcing the admission gate.
pub struct GatedRuntime {
    inner: Arc<dyn SandboxRuntime>,
    config: GateConfig,
    semaphore: Semaphore,
    waiting: AtomicUsize,
}

impl GatedRuntime {
    pub fn new(inner: Arc<dyn SandboxRuntime>, config: GateConfig) -> Self {
        let semaphore = Semaphore::new(config.max_concurrent);
        Self {
            inner,
            config,
            semaphore,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Acquire an in-flight permit, or reject when both the permits and
    /// the waiter queue are exhausted.
    async fn admit(&self) -> Result<SemaphorePermit<'_>> {
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }

        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.config.queue_capacity {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Backpressure(
                "sandbox runtime admission queue is full".into(),
            ));
        }

        let permit = self.semaphore.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| Error::Backpressure("sandbox runtime gate closed".into()))
    }

    /// Run `op` under the gate with bounded retries on retryable errors.
    async fn run<T, Fut>(&self, label: &str, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.admit().await?;

        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let backoff = self.config.backoff_base * 2u32.pow(attempt) + jitter();
                    tracing::warn!(
                        op = label,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retryable sandbox runtime failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

#[async_trait]
impl SandboxRuntime for GatedRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        self.run("create", || self.inner.create(spec)).await
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.run("destroy", || self.inner.destroy(sandbox_id)).await
    }

    async fn exec(&self, sandbox_id: &str, command: &[String]) -> Result<ExecOutput> {
        self.run("exec", || self.inner.exec(sandbox_id, command))
            .await
    }

    async fn attach(&self, sandbox_id: &str) -> Result<AttachedStreams> {
        self.run("attach", || self.inner.attach(sandbox_id)).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

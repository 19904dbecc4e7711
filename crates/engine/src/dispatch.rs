//! Dispatch plane — FIFO job queue with pub/sub result delivery.
//!
//! In worker mode the turn engine enqueues approved calls as jobs
//! instead of executing them inline. Workers pop the shared queue, run
//! the call through the connection plane, and publish the result on the
//! session's channel, where the originating turn collects it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tb_domain::config::DispatchSettings;
use tb_domain::{Error, Result};
use tb_sessions::manager::epoch_ms;
use tb_store::{keys, StateStore};

use crate::cancel::CancelToken;
use crate::executor::ToolExecutor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One enqueued tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolJob {
    pub job_id: String,
    pub session_id: String,
    pub call_id: String,
    pub server_name: String,
    pub original_name: String,
    pub args: Value,
    /// Epoch milliseconds; jobs older than the TTL are failed, not run.
    pub enqueued_at: i64,
}

impl ToolJob {
    pub fn new(
        session_id: &str,
        call_id: &str,
        server_name: &str,
        original_name: &str,
        args: Value,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            call_id: call_id.to_owned(),
            server_name: server_name.to_owned(),
            original_name: original_name.to_owned(),
            args,
            enqueued_at: epoch_ms(),
        }
    }
}

/// Published on `results:{sessionId}` when a job finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolJobResult {
    pub job_id: String,
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher (turn-engine side)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct JobDispatcher {
    store: Arc<dyn StateStore>,
    config: DispatchSettings,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn StateStore>, config: DispatchSettings) -> Self {
        Self { store, config }
    }

    /// Enqueue a batch of jobs and wait for every result.
    ///
    /// The subscription is opened before the first push so no result can
    /// slip past. Results come back in job order regardless of worker
    /// completion order. Stray results for other turns are discarded.
    pub async fn execute_batch(
        &self,
        session_id: &str,
        jobs: Vec<ToolJob>,
        cancel: &CancelToken,
    ) -> Result<Vec<ToolJobResult>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let channel = keys::results_channel(session_id);
        let mut subscription = self.store.subscribe(&channel).await?;

        let mut slots: HashMap<String, usize> = HashMap::new();
        for (idx, job) in jobs.iter().enumerate() {
            slots.insert(job.job_id.clone(), idx);
            self.store
                .list_push(keys::JOBS_QUEUE, &serde_json::to_string(job)?)
                .await?;
        }
        tracing::debug!(session_id, count = jobs.len(), "enqueued tool jobs");

        let mut results: Vec<Option<ToolJobResult>> = vec![None; jobs.len()];
        let mut outstanding = jobs.len();

        // Workers fail jobs that exceed the TTL, so every job resolves
        // within one TTL plus execution time; double it as a hard stop.
        let deadline = self.config.job_ttl * 2;
        let collect = async {
            while outstanding > 0 {
                let payload = tokio::select! {
                    payload = subscription.recv() => payload,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                };
                let Some(payload) = payload else {
                    return Err(Error::TransientExternal(
                        "result channel closed while jobs were outstanding".into(),
                    ));
                };
                let result: ToolJobResult = match serde_json::from_str(&payload) {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding malformed job result");
                        continue;
                    }
                };
                match slots.get(&result.job_id) {
                    Some(&idx) if results[idx].is_none() => {
                        results[idx] = Some(result);
                        outstanding -= 1;
                    }
                    _ => {
                        tracing::debug!(job_id = %result.job_id, "discarding stray job result");
                    }
                }
            }
            Ok(())
        };

        tokio::time::timeout(deadline, collect)
            .await
            .map_err(|_| Error::TransientExternal("timed out waiting for job results".into()))??;

        Ok(results.into_iter().flatten().collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerPool {
    store: Arc<dyn StateStore>,
    executor: Arc<dyn ToolExecutor>,
    config: DispatchSettings,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn ToolExecutor>,
        config: DispatchSettings,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Run `worker_concurrency` consumer loops until `shutdown` flips.
    /// Each worker refuses new pops after shutdown and drains whatever
    /// job it already holds.
    pub async fn run(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let workers: Vec<_> = (0..self.config.worker_concurrency.max(1))
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown).await })
            })
            .collect();
        futures_util::future::join_all(workers).await;
        tracing::info!("worker pool drained");
    }

    async fn worker_loop(&self, worker: usize, shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::debug!(worker, "worker started");
        loop {
            if *shutdown.borrow() {
                tracing::debug!(worker, "worker stopping");
                return;
            }
            let popped = self
                .store
                .list_pop_blocking(keys::JOBS_QUEUE, self.config.pop_timeout)
                .await;
            match popped {
                Ok(Some(raw)) => self.process(worker, &raw).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(worker, error = %err, "queue pop failed");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn process(&self, worker: usize, raw: &str) {
        let job: ToolJob = match serde_json::from_str(raw) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(worker, error = %err, "discarding malformed job");
                return;
            }
        };

        let age_ms = epoch_ms() - job.enqueued_at;
        let result = if age_ms > self.config.job_ttl.as_millis() as i64 {
            tracing::warn!(worker, job_id = %job.job_id, age_ms, "job exceeded TTL in queue");
            ToolJobResult {
                job_id: job.job_id.clone(),
                call_id: job.call_id.clone(),
                success: false,
                output: None,
                error: Some(format!("job expired after {age_ms} ms in queue")),
            }
        } else {
            tracing::debug!(worker, job_id = %job.job_id, tool = %job.original_name, "executing job");
            match self
                .executor
                .call(&job.server_name, &job.original_name, job.args.clone())
                .await
            {
                Ok(call_result) => ToolJobResult {
                    job_id: job.job_id.clone(),
                    call_id: job.call_id.clone(),
                    success: !call_result.is_error,
                    output: serde_json::to_value(&call_result).ok(),
                    error: None,
                },
                Err(err) => ToolJobResult {
                    job_id: job.job_id.clone(),
                    call_id: job.call_id.clone(),
                    success: false,
                    output: None,
                    error: Some(err.to_string()),
                },
            }
        };

        let channel = keys::results_channel(&job.session_id);
        match serde_json::to_string(&result) {
            Ok(payload) => {
                if let Err(err) = self.store.publish(&channel, &payload).await {
                    tracing::warn!(worker, job_id = %job.job_id, error = %err, "failed to publish job result");
                }
            }
            Err(err) => {
                tracing::warn!(worker, error = %err, "failed to serialize job result");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tb_domain::tool::ExposedTool;
    use tb_servers::protocol::{ToolCallContent, ToolCallResult};
    use tb_store::MemoryStore;

    struct EchoExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl EchoExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn catalog(&self) -> Vec<ExposedTool> {
            Vec::new()
        }
        async fn resolve(&self, _exposed_name: &str) -> Option<(String, String)> {
            None
        }
        async fn call(
            &self,
            _server_name: &str,
            original_name: &str,
            _args: Value,
        ) -> Result<ToolCallResult> {
            self.calls.lock().push(original_name.to_owned());
            Ok(ToolCallResult {
                content: vec![ToolCallContent {
                    content_type: "text".into(),
                    text: format!("ran {original_name}"),
                }],
                is_error: false,
            })
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            enabled: true,
            worker_concurrency: 1,
            job_ttl: Duration::from_secs(300),
            pop_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn batch_roundtrips_through_workers_in_order() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let executor = EchoExecutor::new();
        let pool = Arc::new(WorkerPool::new(store.clone(), executor.clone(), settings()));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let pool_handle = tokio::spawn(pool.run(shutdown_rx));

        let dispatcher = JobDispatcher::new(store, settings());
        let jobs = vec![
            ToolJob::new("s1", "c1", "fs", "read", serde_json::json!({"p": "/a"})),
            ToolJob::new("s1", "c2", "fs", "list", serde_json::json!({"p": "/"})),
        ];
        let expected_ids: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();

        let results = dispatcher
            .execute_batch("s1", jobs, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(
            results.iter().map(|r| r.job_id.clone()).collect::<Vec<_>>(),
            expected_ids,
            "results preserve job order"
        );
        assert!(results.iter().all(|r| r.success));
        assert_eq!(*executor.calls.lock(), vec!["read".to_string(), "list".to_string()]);

        shutdown_tx.send(true).unwrap();
        pool_handle.await.unwrap();
    }

    #[tokio::test]
    async fn expired_jobs_fail_without_execution() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let executor = EchoExecutor::new();
        let pool = WorkerPool::new(store.clone(), executor.clone(), settings());

        let mut job = ToolJob::new("s1", "c1", "fs", "read", serde_json::json!({}));
        job.enqueued_at = epoch_ms() - 600_000; // ten minutes old

        let mut sub = store.subscribe(&keys::results_channel("s1")).await.unwrap();
        pool.process(0, &serde_json::to_string(&job).unwrap()).await;

        let result: ToolJobResult =
            serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("expired"));
        assert!(executor.calls.lock().is_empty(), "expired job must not run");
    }

    #[tokio::test]
    async fn executor_failure_becomes_failed_result() {
        struct FailingExecutor;

        #[async_trait]
        impl ToolExecutor for FailingExecutor {
            async fn catalog(&self) -> Vec<ExposedTool> {
                Vec::new()
            }
            async fn resolve(&self, _name: &str) -> Option<(String, String)> {
                None
            }
            async fn call(&self, _s: &str, _t: &str, _a: Value) -> Result<ToolCallResult> {
                Err(Error::TransientExternal("server went away".into()))
            }
        }

        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(store.clone(), Arc::new(FailingExecutor), settings());
        let job = ToolJob::new("s1", "c1", "fs", "read", serde_json::json!({}));

        let mut sub = store.subscribe(&keys::results_channel("s1")).await.unwrap();
        pool.process(0, &serde_json::to_string(&job).unwrap()).await;

        let result: ToolJobResult =
            serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("server went away"));
    }

    #[tokio::test]
    async fn cancellation_aborts_waiting_for_results() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let dispatcher = JobDispatcher::new(store, settings());
        let cancel = CancelToken::new();

        let jobs = vec![ToolJob::new("s1", "c1", "fs", "read", serde_json::json!({}))];
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        // No workers are running, so only cancellation can end the wait.
        let err = dispatcher
            .execute_batch("s1", jobs, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let pool = Arc::new(WorkerPool::new(store, EchoExecutor::new(), settings()));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(pool.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker pool must drain promptly")
            .unwrap();
    }
}

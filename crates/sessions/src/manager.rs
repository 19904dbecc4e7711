//! Session lifecycle — idempotent acquisition with distributed
//! single-flight, heartbeats, and termination.
//!
//! At most one live sandbox exists per session id at any instant. The
//! single-flight lock (set-if-absent with TTL in the state store) makes
//! that hold across processes, not just tasks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tb_domain::config::SessionSettings;
use tb_domain::{Error, Result};
use tb_sandbox::{SandboxPool, SandboxRuntime, SandboxSpec};
use tb_store::{keys, StateStore, StoreOp};

use crate::conversation::ConversationStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted session→sandbox binding. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub sandbox_id: String,
    pub created_at: i64,
    pub last_active: i64,
}

/// Caller-supplied overrides for the session's sandbox.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub image: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub command: Option<Vec<String>>,
}

pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn SandboxRuntime>,
    /// Pre-warmed pool; direct runtime creation when absent.
    pool: Option<Arc<SandboxPool>>,
    conversations: Arc<ConversationStore>,
    config: SessionSettings,
    /// Spec used when the caller does not override the image.
    default_spec: SandboxSpec,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn SandboxRuntime>,
        pool: Option<Arc<SandboxPool>>,
        conversations: Arc<ConversationStore>,
        config: SessionSettings,
        default_spec: SandboxSpec,
    ) -> Self {
        Self {
            store,
            runtime,
            pool,
            conversations,
            config,
            default_spec,
        }
    }

    /// Look up a session record. A corrupt record is treated as absent
    /// (and logged) so a bad write cannot wedge the session forever.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let raw = self.store.get(&keys::session(session_id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "corrupt session record, treating as absent");
                    Ok(None)
                }
            },
        }
    }

    /// Return the existing binding (refreshing `lastActive`) or create a
    /// new one under the single-flight lock.
    pub async fn acquire(
        &self,
        session_id: &str,
        options: AcquireOptions,
    ) -> Result<SessionRecord> {
        // Fast path: session already bound.
        if let Some(record) = self.get(session_id).await? {
            return self.heartbeat_record(session_id, record).await;
        }

        let lock_key = keys::session_lock(session_id);
        if !self
            .store
            .acquire_lock(&lock_key, self.config.lock_ttl)
            .await?
        {
            // Someone else is creating this binding. Wait briefly and
            // re-read; if it appeared we are done, otherwise the caller
            // should retry.
            tokio::time::sleep(self.config.contention_wait).await;
            if let Some(record) = self.get(session_id).await? {
                return self.heartbeat_record(session_id, record).await;
            }
            return Err(Error::Contention(format!(
                "session {session_id:?} is being created by another caller"
            )));
        }

        // Re-check under the lock: the record may have landed between the
        // fast path and lock acquisition.
        let result = match self.get(session_id).await? {
            Some(record) => self.heartbeat_record(session_id, record).await,
            None => self.create_binding(session_id, options).await,
        };
        let _ = self.store.release_lock(&lock_key).await;
        result
    }

    async fn create_binding(
        &self,
        session_id: &str,
        options: AcquireOptions,
    ) -> Result<SessionRecord> {
        let sandbox_id = match &self.pool {
            Some(pool) => pool.acquire(session_id).await?,
            None => {
                let spec = self.spec_for(options);
                self.runtime.create(&spec).await?
            }
        };

        let now = epoch_ms();
        let record = SessionRecord {
            sandbox_id: sandbox_id.clone(),
            created_at: now,
            last_active: now,
        };

        // Everything past sandbox creation must clean up on failure so
        // no orphan sandbox survives a failed acquisition.
        if let Err(err) = self.persist_and_clear(session_id, &record).await {
            tracing::warn!(session_id, error = %err, "session setup failed, releasing sandbox");
            self.release_sandbox(session_id, &sandbox_id).await;
            let _ = self
                .store
                .pipeline(vec![
                    StoreOp::Delete {
                        key: keys::session(session_id),
                    },
                    StoreOp::ZRem {
                        key: keys::SESSION_INDEX.into(),
                        member: session_id.to_owned(),
                    },
                ])
                .await;
            return Err(err);
        }

        tracing::info!(session_id, sandbox_id = %record.sandbox_id, "session bound to sandbox");
        Ok(record)
    }

    async fn persist_and_clear(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        self.store
            .pipeline(vec![
                StoreOp::Set {
                    key: keys::session(session_id),
                    value: serde_json::to_string(record)?,
                },
                StoreOp::ZAdd {
                    key: keys::SESSION_INDEX.into(),
                    member: session_id.to_owned(),
                    score: record.last_active,
                },
            ])
            .await?;

        // New binding starts with a clean history; stale logs from an
        // earlier session with the same id must not leak in.
        self.conversations.clear(session_id).await
    }

    /// Bump `lastActive` (monotonically) and refresh the index entry.
    pub async fn heartbeat(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match self.get(session_id).await? {
            None => Ok(None),
            Some(record) => Ok(Some(self.heartbeat_record(session_id, record).await?)),
        }
    }

    async fn heartbeat_record(
        &self,
        session_id: &str,
        mut record: SessionRecord,
    ) -> Result<SessionRecord> {
        record.last_active = record.last_active.max(epoch_ms());
        self.store
            .pipeline(vec![
                StoreOp::Set {
                    key: keys::session(session_id),
                    value: serde_json::to_string(&record)?,
                },
                StoreOp::ZAdd {
                    key: keys::SESSION_INDEX.into(),
                    member: session_id.to_owned(),
                    score: record.last_active,
                },
            ])
            .await?;
        Ok(record)
    }

    /// Release the sandbox, remove the record and its index entry
    /// atomically, and clear the conversation. Returns `false` when the
    /// session did not exist.
    pub async fn terminate(&self, session_id: &str) -> Result<bool> {
        let record = match self.get(session_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        self.release_sandbox(session_id, &record.sandbox_id).await;

        self.store
            .pipeline(vec![
                StoreOp::Delete {
                    key: keys::session(session_id),
                },
                StoreOp::ZRem {
                    key: keys::SESSION_INDEX.into(),
                    member: session_id.to_owned(),
                },
                StoreOp::ListClear {
                    key: keys::conversation(session_id),
                },
            ])
            .await?;

        tracing::info!(session_id, sandbox_id = %record.sandbox_id, "session terminated");
        Ok(true)
    }

    async fn release_sandbox(&self, session_id: &str, sandbox_id: &str) {
        match &self.pool {
            Some(pool) => {
                if let Err(err) = pool.release(session_id).await {
                    tracing::warn!(session_id, error = %err, "failed to release sandbox to pool");
                }
            }
            None => {
                if let Err(err) = self.runtime.destroy(sandbox_id).await {
                    tracing::warn!(sandbox_id, error = %err, "failed to destroy session sandbox");
                }
            }
        }
    }

    fn spec_for(&self, options: AcquireOptions) -> SandboxSpec {
        let mut spec = self.default_spec.clone();
        if let Some(image) = options.image {
            spec.image = image;
        }
        if let Some(env) = options.env {
            spec.env.extend(env);
        }
        if let Some(command) = options.command {
            spec.command = Some(command);
        }
        spec
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tb_domain::config::ConversationSettings;
    use tb_domain::message::ConversationMessage;
    use tb_sandbox::{InProcessRuntime, PoolConfig};
    use tb_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        runtime: Arc<InProcessRuntime>,
        manager: Arc<SessionManager>,
        conversations: Arc<ConversationStore>,
    }

    fn fixture(pool: Option<Arc<SandboxPool>>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(InProcessRuntime::new());
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            runtime.clone(),
            pool,
            conversations.clone(),
            SessionSettings {
                contention_wait: Duration::from_millis(50),
                ..Default::default()
            },
            SandboxSpec {
                image: "tool-srv:1".into(),
                ..Default::default()
            },
        ));
        Fixture {
            store,
            runtime,
            manager,
            conversations,
        }
    }

    #[tokio::test]
    async fn new_session_creates_record_and_index() {
        let fx = fixture(None);
        let record = fx
            .manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();

        assert!(!record.sandbox_id.is_empty());
        assert_eq!(record.created_at, record.last_active);
        assert_eq!(fx.runtime.created_count(), 1);

        // Record and index entry landed in the store.
        assert!(fx.store.get("session:alpha").await.unwrap().is_some());
        let members = fx
            .store
            .zrange_by_score(keys::SESSION_INDEX, i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(members, vec!["alpha".to_string()]);

        // Default resource caps applied to the sandbox spec.
        let spec = fx.runtime.spec_of(&record.sandbox_id).unwrap();
        assert_eq!(spec.image, "tool-srv:1");
        assert_eq!(spec.caps.memory_mib, 512);
        assert_eq!(spec.caps.cpu, 0.5);
        assert!(!spec.caps.network_enabled);
    }

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let fx = fixture(None);
        let first = fx
            .manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();
        let second = fx
            .manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();
        let third = fx
            .manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();

        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(second.sandbox_id, third.sandbox_id);
        assert_eq!(first.created_at, third.created_at);
        assert!(third.last_active >= first.last_active);
        assert_eq!(fx.runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_create_one_sandbox() {
        let fx = fixture(None);
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = fx.manager.clone();
                tokio::spawn(async move {
                    manager.acquire("beta", AcquireOptions::default()).await
                })
            })
            .collect();

        let results = futures_util::future::join_all(tasks).await;
        let mut sandbox_ids = Vec::new();
        for result in results {
            sandbox_ids.push(result.unwrap().unwrap().sandbox_id);
        }

        assert_eq!(fx.runtime.created_count(), 1, "exactly one sandbox created");
        assert!(sandbox_ids.iter().all(|id| id == &sandbox_ids[0]));
        assert_eq!(fx.runtime.live_count(), 1, "no orphan sandboxes");
    }

    #[tokio::test]
    async fn acquire_clears_stale_history() {
        let fx = fixture(None);
        fx.conversations
            .append("alpha", &ConversationMessage::user("stale"))
            .await
            .unwrap();

        fx.manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();
        assert!(fx.conversations.load("alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_removes_everything() {
        let fx = fixture(None);
        fx.manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();
        fx.conversations
            .append("alpha", &ConversationMessage::user("hello"))
            .await
            .unwrap();

        assert!(fx.manager.terminate("alpha").await.unwrap());
        assert!(fx.store.get("session:alpha").await.unwrap().is_none());
        assert_eq!(fx.store.zcard(keys::SESSION_INDEX).await.unwrap(), 0);
        assert!(fx.conversations.load("alpha").await.unwrap().is_empty());
        assert_eq!(fx.runtime.live_count(), 0);

        // Terminating again is a no-op.
        assert!(!fx.manager.terminate("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn pool_backed_sessions_release_to_pool() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(InProcessRuntime::new());
        let pool = Arc::new(SandboxPool::new(
            runtime.clone(),
            PoolConfig {
                min_idle: 0,
                max_total: 4,
                high_water: 4,
                ..Default::default()
            },
        ));
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = SessionManager::new(
            store,
            runtime.clone(),
            Some(pool.clone()),
            conversations,
            SessionSettings::default(),
            SandboxSpec::default(),
        );

        manager.acquire("alpha", AcquireOptions::default()).await.unwrap();
        assert_eq!(pool.stats().active, 1);

        manager.terminate("alpha").await.unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);
        // Sandbox still alive, waiting pre-warmed in the pool.
        assert_eq!(runtime.live_count(), 1);
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_orphans() {
        struct FailingRuntime;

        #[async_trait::async_trait]
        impl SandboxRuntime for FailingRuntime {
            async fn create(&self, _spec: &SandboxSpec) -> Result<String> {
                Err(Error::TransientExternal("runtime down".into()))
            }
            async fn destroy(&self, _id: &str) -> Result<()> {
                Ok(())
            }
            async fn exec(
                &self,
                _id: &str,
                _command: &[String],
            ) -> Result<tb_sandbox::ExecOutput> {
                Ok(tb_sandbox::ExecOutput::default())
            }
            async fn attach(&self, _id: &str) -> Result<tb_sandbox::AttachedStreams> {
                Err(Error::Validation("not supported".into()))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(FailingRuntime),
            None,
            conversations,
            SessionSettings::default(),
            SandboxSpec::default(),
        );

        let err = manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get("session:alpha").await.unwrap().is_none());
        assert_eq!(store.zcard(keys::SESSION_INDEX).await.unwrap(), 0);

        // The lock was released; a retry reaches the runtime again
        // rather than failing on contention.
        let err = manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transient");
    }

    #[tokio::test]
    async fn heartbeat_is_monotonic() {
        let fx = fixture(None);
        fx.manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();

        // Simulate a record stamped in the future (clock skew between
        // brokers sharing the store).
        let future = epoch_ms() + 60_000;
        let skewed = SessionRecord {
            sandbox_id: "sbx-skew".into(),
            created_at: future,
            last_active: future,
        };
        fx.store
            .set(
                "session:alpha",
                &serde_json::to_string(&skewed).unwrap(),
                None,
            )
            .await
            .unwrap();

        let record = fx.manager.heartbeat("alpha").await.unwrap().unwrap();
        assert_eq!(record.last_active, future, "lastActive never goes backward");
    }

    #[tokio::test]
    async fn caller_overrides_shape_the_sandbox_spec() {
        let fx = fixture(None);
        let record = fx
            .manager
            .acquire(
                "alpha",
                AcquireOptions {
                    image: Some("custom:7".into()),
                    env: Some([("A".to_string(), "1".to_string())].into_iter().collect()),
                    command: Some(vec!["serve".into()]),
                },
            )
            .await
            .unwrap();

        let spec = fx.runtime.spec_of(&record.sandbox_id).unwrap();
        assert_eq!(spec.image, "custom:7");
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(spec.command, Some(vec!["serve".to_string()]));
    }
}

//! Idle-session reaper.
//!
//! Uses the `lastActive`-scored index so one sweep is a single range
//! query over the expired prefix, not a scan of every session.

use std::sync::Arc;
use std::time::Duration;

use tb_store::{keys, StateStore};

use crate::manager::{epoch_ms, SessionManager};

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub sweep_interval: Duration,
    /// Sessions idle longer than this are terminated.
    pub idle_ttl: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(15 * 60),
        }
    }
}

pub struct JanitorService {
    store: Arc<dyn StateStore>,
    manager: Arc<SessionManager>,
    config: JanitorConfig,
}

impl JanitorService {
    pub fn new(
        store: Arc<dyn StateStore>,
        manager: Arc<SessionManager>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            store,
            manager,
            config,
        }
    }

    /// Terminate exactly the sessions whose `lastActive` predates the
    /// idle cutoff. Returns how many were reaped.
    pub async fn sweep(&self) -> usize {
        let cutoff = epoch_ms() - self.config.idle_ttl.as_millis() as i64;
        let expired = match self
            .store
            .zrange_by_score(keys::SESSION_INDEX, i64::MIN, cutoff)
            .await
        {
            Ok(expired) => expired,
            Err(err) => {
                tracing::warn!(error = %err, "janitor index query failed, skipping sweep");
                return 0;
            }
        };

        let mut reaped = 0;
        for session_id in expired {
            match self.manager.terminate(&session_id).await {
                Ok(true) => {
                    tracing::info!(session_id = %session_id, "reaped idle session");
                    reaped += 1;
                }
                Ok(false) => {
                    // Record already gone; drop the stale index entry.
                    let _ = self.store.zrem(keys::SESSION_INDEX, &session_id).await;
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to reap session, continuing");
                }
            }
        }
        reaped
    }

    /// Periodic sweep loop. Exits when `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.sweep().await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "janitor sweep complete");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("janitor stopping");
                    return;
                }
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
    use crate::conversation::ConversationStore;
    use crate::manager::{AcquireOptions, SessionRecord};
    use tb_domain::config::{ConversationSettings, SessionSettings};
    use tb_sandbox::{InProcessRuntime, SandboxSpec};
    use tb_store::MemoryStore;

    async fn backdate(store: &MemoryStore, session_id: &str, age: Duration) {
        let stale = epoch_ms() - age.as_millis() as i64;
        let record = SessionRecord {
            sandbox_id: format!("sbx-{session_id}"),
            created_at: stale,
            last_active: stale,
        };
        store
            .set(
                &keys::session(session_id),
                &serde_json::to_string(&record).unwrap(),
                None,
            )
            .await
            .unwrap();
        store
            .zadd(keys::SESSION_INDEX, session_id, stale)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_reaps_exactly_the_expired_set() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(InProcessRuntime::new());
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            runtime.clone(),
            None,
            conversations,
            SessionSettings::default(),
            SandboxSpec::default(),
        ));

        // Eight fresh sessions, two idle for twenty minutes.
        for i in 0..8 {
            manager
                .acquire(&format!("fresh-{i}"), AcquireOptions::default())
                .await
                .unwrap();
        }
        backdate(&store, "stale-0", Duration::from_secs(20 * 60)).await;
        backdate(&store, "stale-1", Duration::from_secs(20 * 60)).await;
        assert_eq!(store.zcard(keys::SESSION_INDEX).await.unwrap(), 10);

        let janitor = JanitorService::new(
            store.clone(),
            manager.clone(),
            JanitorConfig {
                idle_ttl: Duration::from_secs(15 * 60),
                ..Default::default()
            },
        );
        let reaped = janitor.sweep().await;

        assert_eq!(reaped, 2);
        assert_eq!(store.zcard(keys::SESSION_INDEX).await.unwrap(), 8);
        assert!(store.get("session:stale-0").await.unwrap().is_none());
        assert!(store.get("session:fresh-0").await.unwrap().is_some());
        // The eight fresh sessions keep their sandboxes.
        assert_eq!(runtime.live_count(), 8);
    }

    #[tokio::test]
    async fn sweep_with_nothing_expired_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(InProcessRuntime::new());
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            runtime,
            None,
            conversations,
            SessionSettings::default(),
            SandboxSpec::default(),
        ));
        manager
            .acquire("alpha", AcquireOptions::default())
            .await
            .unwrap();

        let janitor =
            JanitorService::new(store.clone(), manager, JanitorConfig::default());
        assert_eq!(janitor.sweep().await, 0);
        assert_eq!(store.zcard(keys::SESSION_INDEX).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_index_entry_without_record_is_pruned() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(InProcessRuntime::new());
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        ));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            runtime,
            None,
            conversations,
            SessionSettings::default(),
            SandboxSpec::default(),
        ));

        // Index entry with no backing record (e.g. crashed mid-terminate).
        store
            .zadd(keys::SESSION_INDEX, "ghost", epoch_ms() - 3_600_000)
            .await
            .unwrap();

        let janitor =
            JanitorService::new(store.clone(), manager, JanitorConfig::default());
        assert_eq!(janitor.sweep().await, 0);
        assert_eq!(store.zcard(keys::SESSION_INDEX).await.unwrap(), 0);
    }
}

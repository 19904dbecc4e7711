//! Pre-warmed sandbox pool.
//!
//! Keeps `min_idle` sandboxes ready so session acquisition skips the
//! cold-start path, bounded by `max_total` across idle and active.
//! Released sandboxes are workspace-reset before re-entering the idle
//! list; a reset failure destroys the sandbox instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use tb_domain::{Error, Result};

use crate::runtime::{SandboxRuntime, SandboxSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_total: usize,
    pub idle_ttl: Duration,
    /// Idle-list cap: sandboxes released beyond it are destroyed.
    pub high_water: usize,
    /// Spec for pool-created sandboxes.
    pub spec: SandboxSpec,
    /// Idempotent workspace cleanup run inside the sandbox on release.
    pub reset_command: Vec<String>,
    pub sweep_interval: Duration,
    pub replenish_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_total: 10,
            idle_ttl: Duration::from_secs(300),
            high_water: 10,
            spec: SandboxSpec::default(),
            reset_command: vec![
                "/bin/sh".into(),
                "-c".into(),
                "rm -rf /workspace/* /workspace/.[!.]* 2>/dev/null || true".into(),
            ],
            sweep_interval: Duration::from_secs(60),
            replenish_interval: Duration::from_secs(5),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub max_total: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct IdleSandbox {
    sandbox_id: String,
    last_used_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest at the front; acquire pops the warmest from the back.
    idle: VecDeque<IdleSandbox>,
    /// session id → sandbox id.
    active: HashMap<String, String>,
    /// Creations in flight, counted against `max_total`.
    creating: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }
}

pub struct SandboxPool {
    runtime: Arc<dyn SandboxRuntime>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl SandboxPool {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Hand a sandbox to `session_id`: warmest idle one if available,
    /// else a fresh creation, else `Backpressure` when at `max_total`.
    pub async fn acquire(&self, session_id: &str) -> Result<String> {
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.active.get(session_id) {
                return Ok(existing.clone());
            }
            if let Some(idle) = state.idle.pop_back() {
                state
                    .active
                    .insert(session_id.to_owned(), idle.sandbox_id.clone());
                tracing::debug!(session_id, sandbox_id = %idle.sandbox_id, "acquired pre-warmed sandbox");
                return Ok(idle.sandbox_id);
            }
            if state.total() >= self.config.max_total {
                return Err(Error::Backpressure("sandbox pool exhausted".into()));
            }
            state.creating += 1;
        }

        let created = self.runtime.create(&self.config.spec).await;
        let mut state = self.state.lock();
        state.creating -= 1;
        match created {
            Ok(sandbox_id) => {
                state
                    .active
                    .insert(session_id.to_owned(), sandbox_id.clone());
                tracing::debug!(session_id, sandbox_id = %sandbox_id, "created sandbox for session");
                Ok(sandbox_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Return a session's sandbox to the pool.
    ///
    /// The workspace is reset first; on reset failure, or when the idle
    /// list sits at high-water, the sandbox is destroyed instead.
    pub async fn release(&self, session_id: &str) -> Result<()> {
        let sandbox_id = {
            let mut state = self.state.lock();
            match state.active.remove(session_id) {
                Some(id) => id,
                None => return Ok(()),
            }
        };

        let reset = self.runtime.exec(&sandbox_id, &self.config.reset_command).await;
        let keep = match reset {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    exit_code = output.exit_code,
                    "workspace reset failed, destroying sandbox"
                );
                false
            }
            Err(err) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %err, "workspace reset errored, destroying sandbox");
                false
            }
        };

        if keep {
            let mut state = self.state.lock();
            if state.idle.len() < self.config.high_water {
                state.idle.push_back(IdleSandbox {
                    sandbox_id,
                    last_used_at: Instant::now(),
                });
                return Ok(());
            }
        }

        self.destroy_quietly(&sandbox_id).await;
        Ok(())
    }

    /// Top the idle list up to `min_idle`, respecting `max_total`.
    pub async fn replenish_once(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.idle.len() >= self.config.min_idle
                    || state.total() >= self.config.max_total
                {
                    return;
                }
                state.creating += 1;
            }

            let created = self.runtime.create(&self.config.spec).await;
            let mut state = self.state.lock();
            state.creating -= 1;
            match created {
                Ok(sandbox_id) => {
                    state.idle.push_back(IdleSandbox {
                        sandbox_id,
                        last_used_at: Instant::now(),
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pool replenish failed");
                    return;
                }
            }
        }
    }

    /// Destroy idle sandboxes past their idle TTL, keeping `min_idle`.
    pub async fn evict_expired(&self) {
        let now = Instant::now();
        let victims: Vec<String> = {
            let mut state = self.state.lock();
            let mut victims = Vec::new();
            while state.idle.len() > self.config.min_idle {
                match state.idle.front() {
                    Some(oldest) if now.duration_since(oldest.last_used_at) > self.config.idle_ttl => {
                        victims.push(state.idle.pop_front().map(|s| s.sandbox_id).unwrap_or_default());
                    }
                    _ => break,
                }
            }
            victims
        };

        for sandbox_id in victims {
            tracing::debug!(sandbox_id = %sandbox_id, "evicting idle sandbox");
            self.destroy_quietly(&sandbox_id).await;
        }
    }

    /// Background replenish + eviction loop. Exits when `shutdown` flips.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut replenish = tokio::time::interval(self.config.replenish_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = replenish.tick() => self.replenish_once().await,
                _ = sweep.tick() => self.evict_expired().await,
                _ = shutdown.changed() => {
                    tracing::debug!("pool maintenance loop stopping");
                    return;
                }
            }
        }
    }

    /// Destroy every sandbox the pool knows about.
    pub async fn shutdown(&self) {
        let all: Vec<String> = {
            let mut state = self.state.lock();
            let mut all: Vec<String> =
                state.idle.drain(..).map(|s| s.sandbox_id).collect();
            all.extend(state.active.drain().map(|(_, sandbox_id)| sandbox_id));
            all
        };
        for sandbox_id in all {
            self.destroy_quietly(&sandbox_id).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active.len(),
            max_total: self.config.max_total,
        }
    }

    async fn destroy_quietly(&self, sandbox_id: &str) {
        if let Err(err) = self.runtime.destroy(sandbox_id).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %err, "failed to destroy sandbox");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

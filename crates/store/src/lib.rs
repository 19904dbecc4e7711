//! The `StateStore` capability.
//!
//! Session bindings, the activity index, conversation logs, the job queue,
//! and result channels all live behind this trait. The production deployment
//! points it at an external KV/stream store; [`MemoryStore`] is the
//! in-process implementation used by tests and single-node mode.

pub mod keys;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use tb_domain::Result;

pub use memory::MemoryStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One write in an atomic pipeline. The whole batch is applied with no
/// interleaved observer: either every op is visible or none is.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Delete { key: String },
    ZAdd { key: String, member: String, score: i64 },
    ZRem { key: String, member: String },
    ListClear { key: String },
}

/// An active pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: tokio::sync::broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: tokio::sync::broadcast::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Receive the next payload. Returns `None` when the channel closes.
    /// Messages published while the receiver lags are dropped (at-most-once
    /// delivery within a subscription).
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscription lagged, dropping messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StateStore trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// External KV + sorted-set + list + pub/sub capability.
///
/// Scores in the sorted-set operations are epoch milliseconds.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Key/value ────────────────────────────────────────────────
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    // ── Sorted-set index ─────────────────────────────────────────
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    /// Members with `min <= score <= max`, ordered by ascending score.
    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    // ── Atomic pipeline ──────────────────────────────────────────
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<()>;

    // ── Lock with TTL (set-if-absent with expiry) ────────────────
    /// Returns `true` when this caller obtained the lock.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release_lock(&self, key: &str) -> Result<()>;

    // ── FIFO list / queue ────────────────────────────────────────
    /// Append to the tail; returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<u64>;
    /// Pop from the head, waiting up to `timeout` for an element.
    async fn list_pop_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
    /// All elements, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;
    /// Keep only the last `keep` elements.
    async fn list_trim_to_tail(&self, key: &str, keep: usize) -> Result<()>;
    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Set or refresh a TTL on any key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    // ── Pub/sub ──────────────────────────────────────────────────
    /// Publish to a channel; returns the number of active subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

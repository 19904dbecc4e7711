//! In-process `StateStore` implementation.
//!
//! Single-node deployments and tests run against this store. Semantics
//! mirror the external store: lazy TTL expiry, set-if-absent locks,
//! blocking list pops, and fan-out pub/sub channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use tb_domain::Result;

use crate::{StateStore, StoreOp, Subscription};

const PUBSUB_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    zsets: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, VecDeque<String>>,
    expiries: HashMap<String, Instant>,
}

impl Inner {
    /// Drop the key if its TTL has passed.
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.kv.remove(key);
                self.lists.remove(key);
                self.zsets.remove(key);
            }
        }
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.kv.insert(key, value);
            }
            StoreOp::Delete { key } => {
                self.kv.remove(&key);
                self.expiries.remove(&key);
            }
            StoreOp::ZAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            StoreOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                }
            }
            StoreOp::ListClear { key } => {
                self.lists.remove(&key);
                self.expiries.remove(&key);
            }
        }
    }
}

/// In-process [`StateStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Wakes blocked list pops, one notifier per list key.
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notifiers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn notifier(&self, key: &str) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.kv.insert(key.to_owned(), value.to_owned());
        match ttl {
            Some(ttl) => {
                inner.expiries.insert(key.to_owned(), Instant::now() + ttl);
            }
            None => {
                inner.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.expiries.remove(key);
        Ok(inner.kv.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let candidates: Vec<String> = inner
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut keys = Vec::new();
        for key in candidates {
            inner.purge(&key);
            if inner.kv.contains_key(&key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|zset| zset.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut members: Vec<(i64, String)> = inner
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .map(|zset| zset.len())
            .unwrap_or(0))
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut inner = self.inner.lock();
        for op in ops {
            inner.apply(op);
        }
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.purge(key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(key.to_owned(), "1".to_owned());
        inner.expiries.insert(key.to_owned(), Instant::now() + ttl);
        Ok(true)
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.kv.remove(key);
        inner.expiries.remove(key);
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        let len = {
            let mut inner = self.inner.lock();
            inner.purge(key);
            let list = inner.lists.entry(key.to_owned()).or_default();
            list.push_back(value.to_owned());
            list.len() as u64
        };
        self.notifier(key).notify_one();
        Ok(len)
    }

    async fn list_pop_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let notify = self.notifier(key);
        loop {
            {
                let mut inner = self.inner.lock();
                inner.purge(key);
                if let Some(list) = inner.lists.get_mut(key) {
                    if let Some(value) = list.pop_front() {
                        return Ok(Some(value));
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, notify.notified()).await;
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_trim_to_tail(&self, key: &str, keep: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.lists.get_mut(key) {
            while list.len() > keep {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.lists.get(key).map(|list| list.len() as u64).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner
            .lock()
            .expiries
            .insert(key.to_owned(), Instant::now() + ttl);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let channels = self.channels.lock();
        match channels.get(channel) {
            Some(tx) => Ok(tx.send(payload.to_owned()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0);
        Ok(Subscription::new(tx.subscribe()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

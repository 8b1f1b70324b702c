//! In-memory KV store for tests and single-process deployments.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use super::{KvError, KvStore};

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    counters: HashMap<String, i64>,
}

struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`KvStore`] with the same semantics as the Redis
/// implementation: per-key TTLs, blocking pops, glob key matching.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<Inner>>,
    pushed: Arc<Notify>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(pattern: &str, key: &str) -> bool {
        // Only the prefix* form is used by callers
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.get(key).is_some_and(Entry::expired) {
            inner.entries.remove(key);
            return Ok(None);
        }
        Ok(inner.entries.get(key).map(|e| e.bytes.clone()))
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            key.to_string(),
            Entry {
                bytes: value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.get(key).is_some_and(Entry::expired) {
            inner.entries.remove(key);
        }
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                bytes: value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        inner.lists.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError> {
        let mut inner = self.inner.lock().await;
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.get(key).copied().unwrap_or(0))
    }

    async fn lpush_raw(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        drop(inner);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop_raw(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, KvError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, so a push between the
            // check and the wait is never lost
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(list) = inner.lists.get_mut(key) {
                    if let Some(value) = list.pop_back() {
                        return Ok(Some(value));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrange_raw(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| !entry.expired() && Self::matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            inner
                .lists
                .keys()
                .filter(|key| Self::matches(pattern, key))
                .cloned(),
        );
        keys.extend(
            inner
                .counters
                .keys()
                .filter(|key| Self::matches(pattern, key))
                .cloned(),
        );
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

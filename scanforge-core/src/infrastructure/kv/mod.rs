//! Key-value store abstraction.
//!
//! The KV store is the only shared mutable state in the system: job
//! records, log pages, queues, CVE cache, and pipeline counters all live
//! behind this trait. All writes are atomic at key granularity.
//!
//! [`RedisKvStore`] is the production implementation; [`MemoryKvStore`]
//! backs the test suites.

mod memory_kv;
mod redis_kv;

pub use memory_kv::MemoryKvStore;
pub use redis_kv::RedisKvStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// KV operation errors.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("KV connection error: {0}")]
    Connection(String),
    #[error("KV operation failed: {0}")]
    Operation(String),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Object-safe KV port. Raw byte operations only; serde helpers live on
/// [`KvStoreExt`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// SET with an optional TTL. A `None` TTL persists until deleted.
    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// SET if absent; returns whether the write happened.
    async fn set_nx_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomic counter increment; creates the counter at zero.
    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError>;

    /// Read a counter previously written by [`KvStore::incr`].
    async fn get_counter(&self, key: &str) -> Result<i64, KvError>;

    async fn lpush_raw(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Blocking tail pop with a timeout; `None` on timeout.
    async fn brpop_raw(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, KvError>;

    async fn llen(&self, key: &str) -> Result<u64, KvError>;

    /// Full list contents, head first.
    async fn lrange_raw(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError>;

    /// Keys matching a glob-style pattern (e.g. `job:*`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}

/// Serde convenience layer over any [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, KvError>
    where
        T: DeserializeOwned,
    {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), KvError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set_raw(key, bytes, ttl).await
    }

    async fn set_nx_json<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set_nx_raw(key, bytes, ttl).await
    }

    async fn lpush_json<T>(&self, key: &str, value: &T) -> Result<(), KvError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.lpush_raw(key, bytes).await
    }

    async fn brpop_json<T>(&self, key: &str, timeout: Duration) -> Result<Option<T>, KvError>
    where
        T: DeserializeOwned,
    {
        match self.brpop_raw(key, timeout).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn lrange_json<T>(&self, key: &str) -> Result<Vec<T>, KvError>
    where
        T: DeserializeOwned,
    {
        self.lrange_raw(key)
            .await?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(KvError::from))
            .collect()
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

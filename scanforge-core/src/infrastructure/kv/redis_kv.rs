//! Redis-backed KV store.
//!
//! Works against any Redis-compatible server (Redis, Dragonfly, Valkey).
//! Uses a multiplexed connection manager; every operation clones the
//! manager, which is cheap and reconnects transparently.

use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::{KvError, KvStore};

/// Redis-compatible KV store implementation.
pub struct RedisKvStore {
    connection_manager: Arc<ConnectionManager>,
}

impl RedisKvStore {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            KvError::Connection(format!("failed to create client: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis connection manager: {}", e);
            KvError::Connection(format!("failed to connect: {}", e))
        })?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to ping Redis: {}", e);
                KvError::Connection(format!("ping failed: {}", e))
            })?;

        debug!("Connected to KV store at {}", url);

        Ok(Self {
            connection_manager: Arc::new(connection_manager),
        })
    }

    fn conn(&self) -> ConnectionManager {
        (*self.connection_manager).clone()
    }

    fn op_err(op: &str, key: &str, e: redis::RedisError) -> KvError {
        error!("Redis {} failed for key {}: {}", op, key, e);
        KvError::Operation(format!("{} {}: {}", op, key, e))
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| Self::op_err("GET", key, e))
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Self::op_err("SET", key, e))
    }

    async fn set_nx_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        // SET ... NX returns nil when the key already exists
        let result: Option<String> = cmd
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| Self::op_err("SET NX", key, e))?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Self::op_err("DEL", key, e))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, KvError> {
        let mut conn = self.conn();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Self::op_err("INCRBY", key, e))
    }

    async fn get_counter(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| Self::op_err("GET", key, e))?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn lpush_raw(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Self::op_err("LPUSH", key, e))
    }

    async fn brpop_raw(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn();
        // BRPOP returns [key, value] or nil on timeout
        let result: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async::<Option<(String, Vec<u8>)>>(&mut conn)
            .await
            .map_err(|e| Self::op_err("BRPOP", key, e))?;
        Ok(result.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        redis::cmd("LLEN")
            .arg(key)
            .query_async::<u64>(&mut conn)
            .await
            .map_err(|e| Self::op_err("LLEN", key, e))
    }

    async fn lrange_raw(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async::<Vec<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| Self::op_err("LRANGE", key, e))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
                .map_err(|e| Self::op_err("SCAN", pattern, e))?;
            found.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }
}

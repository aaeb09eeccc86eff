use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;

// Ingestion must not block on a slow cache; commands are cheap O(1) lookups
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

/// A simple redis wrapper exposing only the commands the ingestion path
/// needs: control-plane reads and windowed counters. A trait so tests can
/// inject failures without a live server.

#[async_trait]
pub trait Client {
    /// GET, None when the key does not exist.
    async fn get(&self, k: String) -> Result<Option<String>>;

    /// INCR within a windowed key, setting the TTL on first increment.
    /// Returns the post-increment count.
    async fn incr_expire(&self, k: String, ttl_secs: u64) -> Result<u64>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<Option<String>> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get(k);
        let fut: Option<String> =
            timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(fut)
    }

    async fn incr_expire(&self, k: String, ttl_secs: u64) -> Result<u64> {
        let mut conn = self.client.get_async_connection().await?;

        let count: u64 = timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            conn.incr(&k, 1u64),
        )
        .await??;

        // Only the first increment of a window needs to arm the expiry.
        // A crash between INCR and EXPIRE leaks one counter key at worst.
        if count == 1 {
            timeout(
                Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
                conn.expire::<_, ()>(&k, ttl_secs as usize),
            )
            .await??;
        }

        Ok(count)
    }
}

// mockall got really annoying with async and results so we do our own
pub struct MockRedisClient {
    get_ret: Mutex<HashMap<String, String>>,
    get_calls: Mutex<Vec<String>>,
    counters: Mutex<HashMap<String, u64>>,
    broken: Mutex<bool>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient {
            get_ret: Mutex::new(HashMap::new()),
            get_calls: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            broken: Mutex::new(false),
        }
    }

    pub fn with_get_ret(self, key: &str, value: &str) -> Self {
        self.get_ret
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Makes every command fail, to exercise fallback paths.
    pub fn set_broken(&self, broken: bool) {
        *self.broken.lock().unwrap() = broken;
    }

    pub fn get_call_count(&self) -> usize {
        self.get_calls.lock().unwrap().len()
    }
}

impl Default for MockRedisClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<Option<String>> {
        if *self.broken.lock().unwrap() {
            return Err(anyhow!("mock redis is broken"));
        }
        self.get_calls.lock().unwrap().push(k.clone());
        Ok(self.get_ret.lock().unwrap().get(&k).cloned())
    }

    async fn incr_expire(&self, k: String, _ttl_secs: u64) -> Result<u64> {
        if *self.broken.lock().unwrap() {
            return Err(anyhow!("mock redis is broken"));
        }
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(k).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

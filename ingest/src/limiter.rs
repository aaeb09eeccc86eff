use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::counter;
use tracing::instrument;

use crate::api::IngestError;
use crate::redis::Client;

const LOCAL_MAP_SWEEP_THRESHOLD: usize = 10_000;

/// Which counter store served the last check. Reported by the health
/// endpoint so operators can see when an instance is under-counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimiterBackend {
    Shared,
    LocalFallback,
}

impl LimiterBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::LocalFallback => "local-fallback",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn into_result(self) -> Result<RateLimitDecision, IngestError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(IngestError::RateLimited {
                limit: self.limit,
                retry_after: self.retry_after_secs,
            })
        }
    }
}

/// In-process fixed-window counter, lazily rolled over on access. No
/// background timers; stale windows are swept when the map grows.
struct WindowCounter {
    count: u64,
    window_index: u64,
}

/// Fixed-window rate limiting on two independent ceilings: one per client
/// IP across all sites, one per (IP, site) pair so a noisy NAT neighbor
/// cannot eat a single tenant's quota.
///
/// Counters live in Redis so all instances share one view. When Redis is
/// unreachable we fall back to per-process counters: requests may be
/// under-counted across instances but never over-counted, which is the safe
/// direction for a limiter guarding best-effort telemetry.
pub struct RateLimiter {
    shared: Arc<dyn Client + Send + Sync>,
    local: Mutex<HashMap<String, WindowCounter>>,
    on_local_fallback: AtomicBool,
    per_ip_limit: u64,
    per_site_limit: u64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(
        shared: Arc<dyn Client + Send + Sync>,
        per_ip_limit: u64,
        per_site_limit: u64,
        window_secs: u64,
    ) -> RateLimiter {
        RateLimiter {
            shared,
            local: Mutex::new(HashMap::new()),
            on_local_fallback: AtomicBool::new(false),
            per_ip_limit,
            per_site_limit,
            window_secs: window_secs.max(1),
        }
    }

    pub fn backend(&self) -> LimiterBackend {
        if self.on_local_fallback.load(Ordering::Relaxed) {
            LimiterBackend::LocalFallback
        } else {
            LimiterBackend::Shared
        }
    }

    #[instrument(skip_all, fields(ip = ip, site_id = site_id))]
    pub async fn check(&self, ip: &str, site_id: &str) -> RateLimitDecision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.check_at(ip, site_id, now).await
    }

    async fn check_at(&self, ip: &str, site_id: &str, now_secs: u64) -> RateLimitDecision {
        let window_index = now_secs / self.window_secs;
        let retry_after_secs = self.window_secs - (now_secs % self.window_secs);

        let ip_key = format!("ratelimit:ip:{ip}:{window_index}");
        let site_key = format!("ratelimit:site:{site_id}:{ip}:{window_index}");

        // Both keys are bumped even for rejected requests so abusers keep
        // paying into the window
        let counts = self.incr_shared(&ip_key, &site_key).await;
        let (ip_count, site_count) = match counts {
            Some(counts) => {
                self.on_local_fallback.store(false, Ordering::Relaxed);
                counts
            }
            None => {
                if !self.on_local_fallback.swap(true, Ordering::Relaxed) {
                    tracing::warn!("shared counter store unavailable, using local counters");
                }
                counter!("ingest_ratelimit_local_fallback_total").increment(1);
                (
                    self.incr_local(&ip_key, window_index),
                    self.incr_local(&site_key, window_index),
                )
            }
        };

        if ip_count > self.per_ip_limit {
            counter!("ingest_ratelimit_rejected_total", "scope" => "ip").increment(1);
            return RateLimitDecision {
                allowed: false,
                limit: self.per_ip_limit,
                remaining: 0,
                retry_after_secs,
            };
        }

        if site_count > self.per_site_limit {
            counter!("ingest_ratelimit_rejected_total", "scope" => "site").increment(1);
            return RateLimitDecision {
                allowed: false,
                limit: self.per_site_limit,
                remaining: 0,
                retry_after_secs,
            };
        }

        let remaining = std::cmp::min(
            self.per_ip_limit - ip_count,
            self.per_site_limit - site_count,
        );
        RateLimitDecision {
            allowed: true,
            limit: self.per_site_limit,
            remaining,
            retry_after_secs,
        }
    }

    async fn incr_shared(&self, ip_key: &str, site_key: &str) -> Option<(u64, u64)> {
        let ttl = self.window_secs * 2;
        let ip_count = self.shared.incr_expire(ip_key.to_string(), ttl).await.ok()?;
        let site_count = self
            .shared
            .incr_expire(site_key.to_string(), ttl)
            .await
            .ok()?;
        Some((ip_count, site_count))
    }

    fn incr_local(&self, key: &str, window_index: u64) -> u64 {
        let mut map = self.local.lock().expect("rate limit map lock poisoned");

        if map.len() > LOCAL_MAP_SWEEP_THRESHOLD {
            map.retain(|_, counter| counter.window_index >= window_index);
        }

        let counter = map.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            window_index,
        });
        if counter.window_index != window_index {
            counter.count = 0;
            counter.window_index = window_index;
        }
        counter.count += 1;
        counter.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockRedisClient;

    #[tokio::test]
    async fn rejects_request_over_the_per_ip_ceiling() {
        let redis = Arc::new(MockRedisClient::new());
        let limiter = RateLimiter::new(redis, 3, 100, 60);

        for _ in 0..3 {
            assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        }
        let decision = limiter.check_at("1.2.3.4", "site-a", 1000).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs > 0 && decision.retry_after_secs <= 60);

        // A different IP is unaffected
        assert!(limiter.check_at("5.6.7.8", "site-a", 1000).await.allowed);
    }

    #[tokio::test]
    async fn per_site_ceiling_is_independent() {
        let redis = Arc::new(MockRedisClient::new());
        let limiter = RateLimiter::new(redis, 100, 2, 60);

        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(!limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);

        // Same IP, different site: its own budget
        assert!(limiter.check_at("1.2.3.4", "site-b", 1000).await.allowed);
    }

    #[tokio::test]
    async fn window_rollover_resets_the_counter() {
        let redis = Arc::new(MockRedisClient::new());
        let limiter = RateLimiter::new(redis, 2, 100, 60);

        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(!limiter.check_at("1.2.3.4", "site-a", 1001).await.allowed);

        // Next window: accepted again. The mock store keys by window index,
        // so a fresh index means a fresh counter.
        assert!(limiter.check_at("1.2.3.4", "site-a", 1060).await.allowed);
    }

    #[tokio::test]
    async fn falls_back_to_local_counters_when_redis_is_down() {
        let redis = Arc::new(MockRedisClient::new());
        let limiter = RateLimiter::new(redis.clone(), 2, 100, 60);

        assert_eq!(limiter.backend(), LimiterBackend::Shared);

        redis.set_broken(true);
        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert_eq!(limiter.backend(), LimiterBackend::LocalFallback);

        // The local store still enforces the ceiling
        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(!limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);

        // And the limiter recovers once redis is reachable
        redis.set_broken(false);
        let _ = limiter.check_at("1.2.3.4", "site-a", 1000).await;
        assert_eq!(limiter.backend(), LimiterBackend::Shared);
    }

    #[tokio::test]
    async fn local_rollover_is_lazy() {
        let redis = Arc::new(MockRedisClient::new());
        redis.set_broken(true);
        let limiter = RateLimiter::new(redis, 2, 100, 60);

        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(!limiter.check_at("1.2.3.4", "site-a", 1000).await.allowed);
        assert!(limiter.check_at("1.2.3.4", "site-a", 1060).await.allowed);
    }
}

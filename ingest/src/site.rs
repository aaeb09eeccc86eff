use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::api::IngestError;
use crate::redis::Client;
use crate::utils::origin_host;

/// Control-plane key prefix. The dashboard side owns these records; the
/// ingestion core only ever reads them.
pub const SITE_CACHE_PREFIX: &str = "site/";

const SITE_CACHE_SWEEP_THRESHOLD: usize = 10_000;

/// Tenant record as published by the control plane.
#[derive(Clone, Debug, Deserialize)]
pub struct Site {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub banned: bool,
}

/// Outcome of a successful gatekeeper check, carrying what the response
/// layer needs to emit CORS headers.
#[derive(Clone, Debug)]
pub struct ValidatedSite {
    pub id: Uuid,
    /// Origin header value to reflect back, when the caller sent one.
    pub allowed_origin: Option<String>,
}

/// Negative entries (`site: None`) are cached too, so enumeration probes
/// pay one lookup per TTL instead of one per request.
struct CacheEntry {
    site: Option<Site>,
    expires_at: Instant,
}

pub struct SiteGatekeeper {
    redis: Arc<dyn Client + Send + Sync>,
    cache: RwLock<HashMap<Uuid, CacheEntry>>,
    ttl: Duration,
}

impl SiteGatekeeper {
    pub fn new(redis: Arc<dyn Client + Send + Sync>, ttl: Duration) -> SiteGatekeeper {
        SiteGatekeeper {
            redis,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// The whole trust boundary: id shape, tenant lookup, ban status,
    /// API-key symmetry and origin policy, cheapest check first.
    #[instrument(skip_all, fields(site_id = site_id))]
    pub async fn verify(
        &self,
        site_id: &str,
        origin: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<ValidatedSite, IngestError> {
        // Shape check is free; nothing touches the cache or the control
        // plane for garbage ids.
        let id = Uuid::parse_str(site_id).map_err(|_| IngestError::InvalidSiteId)?;

        let site = match self.lookup(id).await? {
            Some(site) => site,
            None => return Err(IngestError::UnknownSite),
        };

        // Banned wins over everything, including a correct key
        if site.banned {
            return Err(IngestError::SiteBanned);
        }

        // All four (site key, tracker key) combinations, explicitly:
        //   neither         -> reject (strict policy)
        //   site only       -> reject
        //   tracker only    -> accept (tracker being conservative)
        //   both            -> byte-equal or reject
        match (site.api_key.as_deref(), api_key) {
            (None, None) => return Err(IngestError::MissingApiKey),
            (Some(_), None) => return Err(IngestError::MissingApiKey),
            (None, Some(_)) => {}
            (Some(expected), Some(presented)) => {
                if expected.as_bytes() != presented.as_bytes() {
                    return Err(IngestError::ApiKeyMismatch);
                }
            }
        }

        if let Some(domain) = site.domain.as_deref() {
            match origin {
                Some(value) => {
                    let host = origin_host(value).ok_or(IngestError::OriginNotAllowed)?;
                    let domain = domain.to_ascii_lowercase();
                    if host != domain && !host.ends_with(&format!(".{domain}")) {
                        return Err(IngestError::OriginNotAllowed);
                    }
                }
                // Browsers always send Origin cross-site; its absence is
                // only acceptable for keyed server-to-server calls.
                None => {
                    if api_key.is_none() {
                        return Err(IngestError::OriginNotAllowed);
                    }
                }
            }
        }

        Ok(ValidatedSite {
            id,
            allowed_origin: origin.map(String::from),
        })
    }

    /// Cache-first read with eager eviction on expiry. Concurrent misses may
    /// race to repopulate the same entry; last write wins and both writes
    /// hold identical data.
    async fn lookup(&self, id: Uuid) -> Result<Option<Site>, IngestError> {
        {
            let cache = self.cache.read().expect("site cache lock poisoned");
            if let Some(entry) = cache.get(&id) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.site.clone());
                }
            }
        }

        // Expired or missing: drop any stale entry before the awaited fetch
        self.cache
            .write()
            .expect("site cache lock poisoned")
            .remove(&id);

        let fetched = self
            .redis
            .get(format!("{SITE_CACHE_PREFIX}{id}"))
            .await
            .map_err(|e| {
                tracing::error!("site lookup failed: {}", e);
                IngestError::ControlPlaneUnavailable
            })?;

        let site = match fetched {
            None => None,
            Some(raw) => match serde_json::from_str::<Site>(&raw) {
                Ok(site) => Some(site),
                Err(e) => {
                    // Corrupt control-plane data: fail closed but do not
                    // cache, the record may be mid-rewrite
                    tracing::error!("failed to parse site record: {}", e);
                    return Err(IngestError::ControlPlaneUnavailable);
                }
            },
        };

        let mut cache = self.cache.write().expect("site cache lock poisoned");

        // Negative entries accumulate under enumeration probing; sweep the
        // expired ones once the map grows instead of letting it grow without
        // bound
        if cache.len() > SITE_CACHE_SWEEP_THRESHOLD {
            let now = Instant::now();
            cache.retain(|_, entry| entry.expires_at > now);
        }

        cache.insert(
            id,
            CacheEntry {
                site: site.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(site)
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.read().expect("site cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockRedisClient;

    const SITE_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn gatekeeper_with(site_json: &str) -> (Arc<MockRedisClient>, SiteGatekeeper) {
        let redis = Arc::new(
            MockRedisClient::new().with_get_ret(&format!("{SITE_CACHE_PREFIX}{SITE_ID}"), site_json),
        );
        let gatekeeper = SiteGatekeeper::new(redis.clone(), Duration::from_secs(300));
        (redis, gatekeeper)
    }

    #[tokio::test]
    async fn malformed_site_id_rejects_before_any_lookup() {
        let redis = Arc::new(MockRedisClient::new());
        let gatekeeper = SiteGatekeeper::new(redis.clone(), Duration::from_secs(300));

        let err = gatekeeper
            .verify("not-a-uuid", Some("https://example.com"), Some("key"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidSiteId));
        assert_eq!(redis.get_call_count(), 0);
    }

    #[tokio::test]
    async fn banned_site_rejects_even_with_matching_key() {
        let (_redis, gatekeeper) =
            gatekeeper_with(r#"{"api_key": "sk_1", "domain": null, "banned": true}"#);

        let err = gatekeeper
            .verify(SITE_ID, None, Some("sk_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SiteBanned));
    }

    #[tokio::test]
    async fn api_key_truth_table() {
        // (site key, tracker key) -> expectation
        let cases: Vec<(Option<&str>, Option<&str>, bool)> = vec![
            (None, None, false),
            (Some("sk_1"), None, false),
            (None, Some("sk_1"), true),
            (Some("sk_1"), Some("sk_1"), true),
            (Some("sk_1"), Some("sk_2"), false),
        ];

        for (site_key, tracker_key, expect_ok) in cases {
            let site_json = match site_key {
                Some(k) => format!(r#"{{"api_key": "{k}", "banned": false}}"#),
                None => r#"{"banned": false}"#.to_string(),
            };
            let (_redis, gatekeeper) = gatekeeper_with(&site_json);

            let result = gatekeeper.verify(SITE_ID, None, tracker_key).await;
            assert_eq!(
                result.is_ok(),
                expect_ok,
                "({site_key:?}, {tracker_key:?}) => {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_site_is_negatively_cached() {
        let redis = Arc::new(MockRedisClient::new());
        let gatekeeper = SiteGatekeeper::new(redis.clone(), Duration::from_secs(300));

        for _ in 0..3 {
            let err = gatekeeper
                .verify(SITE_ID, None, Some("sk_1"))
                .await
                .unwrap_err();
            assert!(matches!(err, IngestError::UnknownSite));
        }
        // One control-plane read despite three probes
        assert_eq!(redis.get_call_count(), 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_falls_through_to_the_store() {
        let redis = Arc::new(
            MockRedisClient::new()
                .with_get_ret(&format!("{SITE_CACHE_PREFIX}{SITE_ID}"), r#"{"banned": false}"#),
        );
        let gatekeeper = SiteGatekeeper::new(redis.clone(), Duration::from_secs(0));

        gatekeeper.verify(SITE_ID, None, Some("k")).await.unwrap();
        gatekeeper.verify(SITE_ID, None, Some("k")).await.unwrap();
        assert_eq!(redis.get_call_count(), 2);
    }

    #[tokio::test]
    async fn origin_must_match_configured_domain() {
        let site = r#"{"domain": "example.com", "banned": false}"#;

        let (_r, gatekeeper) = gatekeeper_with(site);
        gatekeeper
            .verify(SITE_ID, Some("https://example.com"), Some("k"))
            .await
            .unwrap();

        let (_r, gatekeeper) = gatekeeper_with(site);
        gatekeeper
            .verify(SITE_ID, Some("https://app.example.com:8443"), Some("k"))
            .await
            .unwrap();

        let (_r, gatekeeper) = gatekeeper_with(site);
        let err = gatekeeper
            .verify(SITE_ID, Some("https://evil.com"), Some("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::OriginNotAllowed));

        // Suffix trickery does not count as a subdomain
        let (_r, gatekeeper) = gatekeeper_with(site);
        let err = gatekeeper
            .verify(SITE_ID, Some("https://notexample.com"), Some("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::OriginNotAllowed));
    }

    #[tokio::test]
    async fn missing_origin_needs_an_api_key_when_domain_is_set() {
        let site = r#"{"domain": "example.com", "banned": false}"#;

        // Keyed server-to-server call: fine
        let (_r, gatekeeper) = gatekeeper_with(site);
        gatekeeper.verify(SITE_ID, None, Some("k")).await.unwrap();

        // Keyless and originless: rejected
        let site_with_key = r#"{"api_key": null, "domain": "example.com", "banned": false}"#;
        let (_r, gatekeeper) = gatekeeper_with(site_with_key);
        let err = gatekeeper.verify(SITE_ID, None, None).await.unwrap_err();
        assert!(matches!(err, IngestError::MissingApiKey));
    }

    #[tokio::test]
    async fn expired_cache_entries_are_swept_once_the_map_grows() {
        let redis = Arc::new(MockRedisClient::new());
        let gatekeeper = SiteGatekeeper::new(redis, Duration::from_secs(0));

        // Probe traffic: distinct unknown ids, each leaving a negative entry
        // that is immediately stale at TTL zero
        for i in 0..(SITE_CACHE_SWEEP_THRESHOLD + 2) {
            let id = Uuid::from_u128(i as u128);
            gatekeeper
                .verify(&id.to_string(), None, Some("k"))
                .await
                .unwrap_err();
        }

        // Crossing the threshold swept the stale entries; only the last
        // probe's own entry remains
        assert_eq!(gatekeeper.cache_len(), 1);
    }

    #[tokio::test]
    async fn control_plane_outage_fails_closed() {
        let redis = Arc::new(MockRedisClient::new());
        redis.set_broken(true);
        let gatekeeper = SiteGatekeeper::new(redis, Duration::from_secs(300));

        let err = gatekeeper
            .verify(SITE_ID, None, Some("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ControlPlaneUnavailable));
    }
}

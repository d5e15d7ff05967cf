//! Opportunistic key/value cache.
//!
//! Every read tolerates a miss, a decode failure or an unreachable Redis; every
//! write failure is logged and swallowed. Callers must compute the correct
//! answer without the cache.

use log::{debug, warn};
#[cfg(feature = "cache")]
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
#[cfg(feature = "cache")]
use std::sync::Arc;

pub const DASHBOARD_TTL_SECS: u64 = 60;
pub const PROVIDER_REPORT_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub struct CacheConfig {
    pub key_prefix: String,
    pub default_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "affiliate".to_string(),
            default_ttl: DASHBOARD_TTL_SECS,
        }
    }
}

#[derive(Clone)]
pub struct OpportunisticCache {
    #[cfg(feature = "cache")]
    client: Option<Arc<redis::Client>>,
    config: CacheConfig,
}

impl OpportunisticCache {
    /// A cache that always misses.
    pub fn disabled() -> Self {
        Self {
            #[cfg(feature = "cache")]
            client: None,
            config: CacheConfig::default(),
        }
    }

    #[cfg(feature = "cache")]
    pub fn new(client: Option<Arc<redis::Client>>, config: CacheConfig) -> Self {
        Self { client, config }
    }

    /// Opens a client for `url`. An invalid URL leaves the cache disabled.
    pub fn connect(url: Option<&str>) -> Self {
        #[cfg(feature = "cache")]
        {
            let client = url.and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!("Cache disabled, invalid cache URL: {}", e);
                    None
                }
            });
            Self::new(client, CacheConfig::default())
        }
        #[cfg(not(feature = "cache"))]
        {
            if url.is_some() {
                warn!("Cache URL configured but the cache feature is not compiled in");
            }
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        #[cfg(feature = "cache")]
        {
            self.client.is_some()
        }
        #[cfg(not(feature = "cache"))]
        {
            false
        }
    }

    pub fn key(&self, namespace: &str, parts: &[&str]) -> String {
        format!("{}:{}:{}", self.config.key_prefix, namespace, parts.join(":"))
    }

    /// Key for arbitrary query payloads, hashed so it stays short.
    pub fn hashed_key(&self, namespace: &str, payload: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}:{}:{}", self.config.key_prefix, namespace, &digest[..32])
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        #[cfg(feature = "cache")]
        {
            let client = self.client.as_ref()?;
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("Cache connection failed: {}", e);
                    return None;
                }
            };
            let raw = match conn.get::<_, Option<String>>(key).await {
                Ok(value) => value,
                Err(e) => {
                    debug!("Cache read failed for {}: {}", key, e);
                    return None;
                }
            };
            match serde_json::from_str(&raw?) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("Discarding undecodable cache entry {}: {}", key, e);
                    None
                }
            }
        }
        #[cfg(not(feature = "cache"))]
        {
            debug!("Cache miss for {} (cache not compiled in)", key);
            None
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) {
        #[cfg(feature = "cache")]
        {
            let Some(client) = self.client.as_ref() else {
                return;
            };
            let json = match serde_json::to_string(value) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Cache write skipped for {}: {}", key, e);
                    return;
                }
            };
            let ttl = ttl.unwrap_or(self.config.default_ttl);
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    if let Err(e) = conn.set_ex::<_, _, ()>(key, json, ttl).await {
                        warn!("Cache write failed for {}: {}", key, e);
                    }
                }
                Err(e) => warn!("Cache connection failed on write: {}", e),
            }
        }
        #[cfg(not(feature = "cache"))]
        {
            let _ = (key, value, ttl);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        #[cfg(feature = "cache")]
        {
            let Some(client) = self.client.as_ref() else {
                return;
            };
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    if let Err(e) = conn.del::<_, ()>(key).await {
                        warn!("Cache invalidation failed for {}: {}", key, e);
                    }
                }
                Err(e) => warn!("Cache connection failed on invalidate: {}", e),
            }
        }
        #[cfg(not(feature = "cache"))]
        {
            let _ = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = OpportunisticCache::disabled();
        assert!(!cache.is_enabled());
        cache.set_json("affiliate:test:1", &42u32, Some(10)).await;
        let value: Option<u32> = cache.get_json("affiliate:test:1").await;
        assert!(value.is_none());
        cache.invalidate("affiliate:test:1").await;
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    async fn test_unreachable_cache_misses_without_error() {
        let cache = OpportunisticCache::connect(Some("redis://127.0.0.1:1"));
        assert!(cache.is_enabled());
        cache.set_json("affiliate:test:2", &"value", None).await;
        let value: Option<String> = cache.get_json("affiliate:test:2").await;
        assert!(value.is_none());
    }

    #[test]
    fn test_invalid_url_disables_cache() {
        let cache = OpportunisticCache::connect(Some("not a url"));
        assert!(!cache.is_enabled());
    }

    #[test]
    fn test_key_layout() {
        let cache = OpportunisticCache::disabled();
        assert_eq!(
            cache.key("dashboard", &["org", "7"]),
            "affiliate:dashboard:org:7"
        );
        let a = cache.hashed_key("report", &serde_json::json!({"from": "2025-01-01"}));
        let b = cache.hashed_key("report", &serde_json::json!({"from": "2025-01-02"}));
        assert_ne!(a, b);
        assert!(a.starts_with("affiliate:report:"));
    }
}

//! Fingerprint-keyed cache
//!
//! A thin JSON cache over Redis. Keys are `cache:<namespace>:<fingerprint>`
//! where the fingerprint hashes the logical identity of the cached value, so
//! callers never worry about key-unsafe characters in DIDs or refs.

use base64::Engine;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct Cache {
    redis: Option<redis::aio::ConnectionManager>,
}

impl Cache {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis: Some(redis) }
    }

    /// A cache that always misses. Every read degrades to its source.
    pub fn disabled() -> Self {
        Self { redis: None }
    }

    fn key(namespace: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let fingerprint =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());
        format!("cache:{namespace}:{fingerprint}")
    }

    /// Fetch a cached value. Transport and decode failures degrade to a miss.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, parts: &[&str]) -> Option<T> {
        let mut conn = self.redis.clone()?;
        let key = Self::key(namespace, parts);
        let raw: Option<String> = match conn.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(namespace, error = %e, "cache read failed");
                return None;
            }
        };
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    pub async fn put<T: Serialize>(
        &self,
        namespace: &str,
        parts: &[&str],
        value: &T,
        ttl_seconds: u64,
    ) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let key = Self::key(namespace, parts);
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "cache encode failed");
                return;
            }
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, ttl_seconds).await {
            tracing::debug!(namespace, error = %e, "cache write failed");
        }
    }

    pub async fn invalidate(&self, namespace: &str, parts: &[&str]) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let key = Self::key(namespace, parts);
        if let Err(e) = conn.del::<_, ()>(&key).await {
            tracing::debug!(namespace, error = %e, "cache invalidation failed");
        }
    }
}

use std::{collections::HashMap, future::Future, sync::Arc};

use base64::{engine::general_purpose, Engine};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::debug;

pub const SNAPSHOT_TTL: Duration = Duration::hours(1);
pub const EMBED_TTL: Duration = Duration::hours(24);
pub const REDIRECT_TTL: Duration = Duration::hours(24);

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

struct Entry<V> {
    value: V,
    expires_at: OffsetDateTime,
}

pub struct TtlCache<V> {
    name: &'static str,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| now < e.expires_at)
            .map(|e| e.value.clone())
    }

    pub async fn insert(&self, key: &str, value: V, ttl: Duration) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| now < e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    // Concurrent misses on one key each compute; the last write wins. Errors are
    // never stored.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        debug!(cache = self.name, "cache miss");
        let value = compute().await?;
        self.insert(key, value.clone(), ttl).await;
        Ok(value)
    }
}

/// Canonical cache key for a URL: unpadded URL-safe base64.
pub fn url_key(url: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Decodes a base64 URL path segment. Browser `btoa` output (standard alphabet,
/// padded) and URL-safe encodings are both accepted.
pub fn decode_url_param(encoded: &str) -> Option<String> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let bytes = general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .ok()?;
    let url = String::from_utf8(bytes).ok()?;
    if url.trim().is_empty() {
        return None;
    }
    Some(url)
}

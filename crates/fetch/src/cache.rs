use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use trawler_core::FetchResponse;

/// Process-local response cache keyed by canonical URL. A TTL of zero
/// disables it.
pub struct ResponseCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, FetchResponse)>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, url: &str) -> Option<FetchResponse> {
        if self.ttl.is_zero() {
            return None;
        }
        if let Some(entry) = self.entries.get(url) {
            let (stored_at, response) = entry.value();
            if stored_at.elapsed() < self.ttl {
                debug!(url, "response cache hit");
                return Some(response.clone());
            }
        }
        self.entries.remove(url);
        None
    }

    pub fn put(&self, url: &str, response: FetchResponse) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries
            .insert(url.to_string(), (Instant::now(), response));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub url: String,
    pub healthy: bool,
    pub cooldown_until: Option<Instant>,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

impl ProxyEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: true,
            cooldown_until: None,
            requests: 0,
            successes: 0,
            failures: 0,
        }
    }
}

/// Round-robin over healthy proxies. Entries marked bad sit out until their
/// cooldown passes; when the whole pool has gone bad the bad set is cleared
/// and selection retried once, so a non-empty pool always yields a proxy.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    entries: Vec<ProxyEntry>,
    cursor: usize,
}

impl ProxyPool {
    pub fn new(urls: &[String]) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                entries: urls.iter().cloned().map(ProxyEntry::new).collect(),
                cursor: 0,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|p| p.entries.is_empty()).unwrap_or(true)
    }

    pub fn next(&self) -> Option<String> {
        let mut inner = self.inner.lock().ok()?;
        if inner.entries.is_empty() {
            return None;
        }
        let now = Instant::now();
        for pass in 0..2 {
            let n = inner.entries.len();
            for _ in 0..n {
                let idx = inner.cursor % n;
                inner.cursor = inner.cursor.wrapping_add(1);
                let entry = &mut inner.entries[idx];
                let cooled_down = entry
                    .cooldown_until
                    .map(|until| now >= until)
                    .unwrap_or(false);
                if cooled_down {
                    entry.healthy = true;
                    entry.cooldown_until = None;
                }
                if entry.healthy {
                    entry.requests += 1;
                    return Some(entry.url.clone());
                }
            }
            if pass == 0 {
                warn!("entire proxy pool marked bad, clearing and retrying");
                for entry in &mut inner.entries {
                    entry.healthy = true;
                    entry.cooldown_until = None;
                }
            }
        }
        None
    }

    pub fn mark_bad(&self, url: &str, cooldown: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == url) {
                entry.healthy = false;
                entry.cooldown_until = Some(Instant::now() + cooldown);
                entry.failures += 1;
                debug!(proxy = %url, "proxy marked bad");
            }
        }
    }

    pub fn mark_success(&self, url: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == url) {
                entry.successes += 1;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ProxyEntry> {
        self.inner
            .lock()
            .map(|p| p.entries.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(urls: &[&str]) -> ProxyPool {
        ProxyPool::new(&urls.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_round_robin_order() {
        let pool = pool(&["http://p1:8080", "http://p2:8080", "http://p3:8080"]);
        assert_eq!(pool.next().as_deref(), Some("http://p1:8080"));
        assert_eq!(pool.next().as_deref(), Some("http://p2:8080"));
        assert_eq!(pool.next().as_deref(), Some("http://p3:8080"));
        assert_eq!(pool.next().as_deref(), Some("http://p1:8080"));
    }

    #[test]
    fn test_bad_proxies_are_skipped() {
        let pool = pool(&["http://p1:8080", "http://p2:8080"]);
        pool.mark_bad("http://p1:8080", Duration::from_secs(60));
        assert_eq!(pool.next().as_deref(), Some("http://p2:8080"));
        assert_eq!(pool.next().as_deref(), Some("http://p2:8080"));
    }

    #[test]
    fn test_fully_bad_pool_is_cleared_once() {
        let pool = pool(&["http://p1:8080", "http://p2:8080"]);
        pool.mark_bad("http://p1:8080", Duration::from_secs(60));
        pool.mark_bad("http://p2:8080", Duration::from_secs(60));
        // pool recovers instead of starving the pipeline
        assert!(pool.next().is_some());
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let pool = pool(&[]);
        assert_eq!(pool.next(), None);
    }

    #[test]
    fn test_stats_are_tracked() {
        let pool = pool(&["http://p1:8080"]);
        let _ = pool.next();
        pool.mark_success("http://p1:8080");
        pool.mark_bad("http://p1:8080", Duration::from_millis(1));
        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].requests, 1);
        assert_eq!(snapshot[0].successes, 1);
        assert_eq!(snapshot[0].failures, 1);
    }
}

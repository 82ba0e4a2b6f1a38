use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use trawler_core::CrawlError;

/// Statuses that always read as a block page.
const BLOCK_STATUSES: [u16; 3] = [403, 503, 999];

/// Anti-bot vendors that give themselves away in the Server header.
const BLOCK_SERVERS: [&str; 3] = ["cloudflare", "distil", "imperva"];

/// Body substrings (lowercased) that mark a block/interstitial page.
const BLOCK_INDICATORS: [&str; 8] = [
    "access denied",
    "blocked",
    "robot",
    "captcha",
    "cloudflare",
    "distil",
    "imperva",
    "incapsula",
];

/// Base per-host delay before the first 429 raises it.
const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the doubling throttle delay.
const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(10);

/// Rolling request-timestamp horizon per host.
const RECENT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Normal,
    Penalised,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignal {
    Blocked,
    RateLimited,
}

#[derive(Debug)]
struct HostRecord {
    state: HostState,
    delay: Option<Duration>,
    blocked_until: Option<Instant>,
    recent: VecDeque<Instant>,
}

impl Default for HostRecord {
    fn default() -> Self {
        Self {
            state: HostState::Normal,
            delay: None,
            blocked_until: None,
            recent: VecDeque::new(),
        }
    }
}

/// The per-host block-table and its state machine:
///
/// ```text
/// Normal ──(block signal)──▶ Penalised(delay, blocked_until)
/// Normal ──(429)──▶ Throttled(delay*2, blocked_until)
/// Penalised ──(now ≥ blocked_until)──▶ Normal
/// Throttled ──(now ≥ blocked_until)──▶ Normal   (delay kept until a success)
/// ```
///
/// Process-local; two workers may race a host in a narrow window, which the
/// design accepts.
#[derive(Default)]
pub struct AntiBlockEngine {
    hosts: DashMap<String, HostRecord>,
}

impl AntiBlockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Does this response read as a block page or a throttle?
    /// Headers are expected with lowercased keys.
    pub fn classify(
        status: u16,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Option<BlockSignal> {
        if BLOCK_STATUSES.contains(&status) {
            return Some(BlockSignal::Blocked);
        }
        if let Some(server) = headers.get("server") {
            let server = server.to_lowercase();
            if BLOCK_SERVERS.iter().any(|s| server.contains(s)) {
                return Some(BlockSignal::Blocked);
            }
        }
        if !body.is_empty() {
            let text = String::from_utf8_lossy(body).to_lowercase();
            if BLOCK_INDICATORS.iter().any(|s| text.contains(s)) {
                return Some(BlockSignal::Blocked);
            }
        }
        if status == 429 {
            return Some(BlockSignal::RateLimited);
        }
        None
    }

    /// Gate before a request: fails while the host is in penalty, otherwise
    /// returns the sleep to apply (host delay plus jitter). Expired penalties
    /// drop the host back to Normal; a raised throttle delay survives until
    /// the next success.
    pub fn pre_check(&self, host: &str) -> Result<Duration, CrawlError> {
        let mut record = self.hosts.entry(host.to_string()).or_default();
        if let Some(until) = record.blocked_until {
            if Instant::now() < until {
                return Err(CrawlError::DomainBlocked(host.to_string()));
            }
            record.blocked_until = None;
            record.state = HostState::Normal;
        }
        let host_delay = record.delay.unwrap_or(Duration::ZERO);
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.1..0.5));
        Ok(host_delay + jitter)
    }

    /// Appends `now` to the host's rolling timestamp list, pruning entries
    /// older than a minute.
    pub fn record_request(&self, host: &str) {
        let now = Instant::now();
        let mut record = self.hosts.entry(host.to_string()).or_default();
        record.recent.push_back(now);
        while let Some(front) = record.recent.front() {
            if now.duration_since(*front) >= RECENT_WINDOW {
                record.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Block detected: penalty window of 5–30 minutes, delay raised to 2–5 s.
    pub fn record_blocked(&self, host: &str) -> Duration {
        let mut rng = rand::thread_rng();
        let penalty = Duration::from_secs(rng.gen_range(300..=1800));
        let delay = Duration::from_secs_f64(rng.gen_range(2.0..5.0));
        let mut record = self.hosts.entry(host.to_string()).or_default();
        record.state = HostState::Penalised;
        record.blocked_until = Some(Instant::now() + penalty);
        record.delay = Some(delay);
        warn!(host, penalty_secs = penalty.as_secs(), "host blocked, entering penalty");
        penalty
    }

    /// 429: double the delay (capped), pause the host for 1–5 minutes.
    pub fn record_rate_limited(&self, host: &str) -> Duration {
        let pause = Duration::from_secs(rand::thread_rng().gen_range(60..=300));
        let mut record = self.hosts.entry(host.to_string()).or_default();
        let current = record.delay.unwrap_or(DEFAULT_DELAY);
        let raised = (current * 2).min(MAX_THROTTLE_DELAY);
        record.delay = Some(raised);
        record.blocked_until = Some(Instant::now() + pause);
        record.state = HostState::Throttled;
        warn!(host, delay_secs = raised.as_secs_f64(), "rate limited, throttling host");
        raised
    }

    /// A clean response clears any raised delay and returns the host to Normal.
    pub fn record_success(&self, host: &str) {
        if let Some(mut record) = self.hosts.get_mut(host) {
            record.delay = None;
            record.state = HostState::Normal;
        }
    }

    pub fn state(&self, host: &str) -> HostState {
        self.hosts
            .get(host)
            .map(|r| r.state)
            .unwrap_or(HostState::Normal)
    }

    pub fn delay(&self, host: &str) -> Option<Duration> {
        self.hosts.get(host).and_then(|r| r.delay)
    }

    pub fn blocked_for(&self, host: &str) -> Option<Duration> {
        let record = self.hosts.get(host)?;
        let until = record.blocked_until?;
        until.checked_duration_since(Instant::now())
    }

    pub fn requests_last_minute(&self, host: &str) -> usize {
        let Some(record) = self.hosts.get(host) else {
            return 0;
        };
        let now = Instant::now();
        record
            .recent
            .iter()
            .filter(|t| now.duration_since(**t) < RECENT_WINDOW)
            .count()
    }

    pub fn reset(&self, host: &str) {
        self.hosts.remove(host);
        debug!(host, "anti-blocking state reset");
    }

    #[cfg(test)]
    fn block_for(&self, host: &str, duration: Duration, state: HostState) {
        let mut record = self.hosts.entry(host.to_string()).or_default();
        record.blocked_until = Some(Instant::now() + duration);
        record.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_classify_by_status() {
        for status in [403, 503, 999] {
            assert_eq!(
                AntiBlockEngine::classify(status, &no_headers(), b""),
                Some(BlockSignal::Blocked)
            );
        }
        assert_eq!(
            AntiBlockEngine::classify(429, &no_headers(), b""),
            Some(BlockSignal::RateLimited)
        );
        assert_eq!(AntiBlockEngine::classify(200, &no_headers(), b"<html>ok</html>"), None);
        assert_eq!(AntiBlockEngine::classify(404, &no_headers(), b""), None);
    }

    #[test]
    fn test_classify_by_server_header() {
        let mut headers = no_headers();
        headers.insert("server".into(), "Cloudflare".into());
        assert_eq!(
            AntiBlockEngine::classify(200, &headers, b"<html>fine</html>"),
            Some(BlockSignal::Blocked)
        );
    }

    #[test]
    fn test_classify_by_body_indicator() {
        assert_eq!(
            AntiBlockEngine::classify(200, &no_headers(), b"<html>Access Denied</html>"),
            Some(BlockSignal::Blocked)
        );
        assert_eq!(
            AntiBlockEngine::classify(200, &no_headers(), b"please solve this CAPTCHA"),
            Some(BlockSignal::Blocked)
        );
    }

    #[test]
    fn test_block_page_on_429_outranks_throttle() {
        // body indicators win over the status-specific branch
        assert_eq!(
            AntiBlockEngine::classify(429, &no_headers(), b"captcha required"),
            Some(BlockSignal::Blocked)
        );
    }

    #[test]
    fn test_block_sets_penalty_window() {
        let engine = AntiBlockEngine::new();
        let penalty = engine.record_blocked("a.test");
        assert!(penalty >= Duration::from_secs(300) && penalty <= Duration::from_secs(1800));
        assert_eq!(engine.state("a.test"), HostState::Penalised);
        let delay = engine.delay("a.test").unwrap();
        assert!(delay >= Duration::from_secs_f64(2.0) && delay <= Duration::from_secs_f64(5.0));
        assert!(matches!(
            engine.pre_check("a.test"),
            Err(CrawlError::DomainBlocked(_))
        ));
    }

    #[test]
    fn test_rate_limit_doubles_delay_with_cap() {
        let engine = AntiBlockEngine::new();
        assert_eq!(engine.record_rate_limited("a.test"), Duration::from_secs(2));
        assert_eq!(engine.record_rate_limited("a.test"), Duration::from_secs(4));
        assert_eq!(engine.record_rate_limited("a.test"), Duration::from_secs(8));
        assert_eq!(engine.record_rate_limited("a.test"), Duration::from_secs(10));
        assert_eq!(engine.record_rate_limited("a.test"), Duration::from_secs(10));
        assert_eq!(engine.state("a.test"), HostState::Throttled);
    }

    #[test]
    fn test_success_clears_throttle_delay() {
        let engine = AntiBlockEngine::new();
        engine.record_rate_limited("a.test");
        engine.record_success("a.test");
        assert_eq!(engine.state("a.test"), HostState::Normal);
        assert_eq!(engine.delay("a.test"), None);
    }

    #[tokio::test]
    async fn test_penalty_expires_back_to_normal() {
        let engine = AntiBlockEngine::new();
        engine.block_for("a.test", Duration::from_millis(20), HostState::Penalised);
        assert!(engine.pre_check("a.test").is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(engine.pre_check("a.test").is_ok());
        assert_eq!(engine.state("a.test"), HostState::Normal);
    }

    #[test]
    fn test_throttle_delay_survives_expiry_until_success() {
        let engine = AntiBlockEngine::new();
        engine.record_rate_limited("a.test");
        engine.block_for("a.test", Duration::from_millis(0), HostState::Throttled);
        // expired window: host usable again, raised delay still applied
        let sleep = engine.pre_check("a.test").unwrap();
        assert!(sleep >= Duration::from_secs(2));
    }

    #[test]
    fn test_pre_check_includes_jitter() {
        let engine = AntiBlockEngine::new();
        let sleep = engine.pre_check("a.test").unwrap();
        assert!(sleep >= Duration::from_secs_f64(0.1));
        assert!(sleep < Duration::from_secs_f64(0.5));
    }

    #[test]
    fn test_rolling_request_window() {
        let engine = AntiBlockEngine::new();
        for _ in 0..5 {
            engine.record_request("a.test");
        }
        assert_eq!(engine.requests_last_minute("a.test"), 5);
        engine.reset("a.test");
        assert_eq!(engine.requests_last_minute("a.test"), 0);
    }
}

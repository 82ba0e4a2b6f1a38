use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use trawler_core::config::DownloadConfig;
use trawler_core::{CrawlError, FetchResponse};

use crate::antiblock::{AntiBlockEngine, BlockSignal};
use crate::cache::ResponseCache;
use crate::proxy::ProxyPool;
use crate::rate_limit::RateLimiter;
use crate::user_agent::UserAgentPool;

/// Concurrency-bounded fetcher serving every logical fetch of one worker
/// process. A request passes, in order: the response cache, the admission
/// semaphore, the global rate limiter, the politeness delay, the anti-block
/// pre-check, header synthesis, proxy selection, and the retry loop.
pub struct FetchPipeline {
    config: DownloadConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    limiter: RateLimiter,
    agents: UserAgentPool,
    proxies: Option<ProxyPool>,
    proxy_clients: HashMap<String, reqwest::Client>,
    blocklist: AntiBlockEngine,
    cache: ResponseCache,
    in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn build_client(config: &DownloadConfig, proxy: Option<&str>) -> Result<reqwest::Client, CrawlError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_seconds))
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .cookie_store(true);
    if let Some(url) = proxy {
        let proxy = reqwest::Proxy::all(url).map_err(|e| CrawlError::Proxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| CrawlError::Config(e.to_string()))
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part[..part.len().min(8)]
            .eq_ignore_ascii_case("charset=")
            .then(|| part[8..].trim_matches('"').to_string())
    })
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(SET_COOKIE) {
        if let Ok(raw) = value.to_str() {
            if let Some(pair) = raw.split(';').next() {
                if let Some((name, value)) = pair.split_once('=') {
                    cookies.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
    }
    cookies
}

impl FetchPipeline {
    pub fn new(config: DownloadConfig) -> Result<Self, CrawlError> {
        let client = build_client(&config, None)?;

        let mut proxy_clients = HashMap::new();
        let proxies = if config.proxy_enabled && !config.proxies.is_empty() {
            for url in &config.proxies {
                match build_client(&config, Some(url)) {
                    Ok(proxied) => {
                        proxy_clients.insert(url.clone(), proxied);
                    }
                    Err(e) => warn!(proxy = %url, error = %e, "skipping unusable proxy"),
                }
            }
            let usable: Vec<String> = config
                .proxies
                .iter()
                .filter(|u| proxy_clients.contains_key(*u))
                .cloned()
                .collect();
            if usable.is_empty() {
                return Err(CrawlError::Proxy("no usable proxies configured".into()));
            }
            Some(ProxyPool::new(&usable))
        } else {
            None
        };

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            limiter: RateLimiter::new(
                config.max_requests,
                Duration::from_secs(config.time_window_seconds),
            ),
            agents: UserAgentPool::new(config.user_agent_rotation),
            cache: ResponseCache::new(Duration::from_secs(config.cache_ttl_seconds)),
            blocklist: AntiBlockEngine::new(),
            in_flight: AtomicUsize::new(0),
            proxies,
            proxy_clients,
            client,
            config,
        })
    }

    pub fn blocklist(&self) -> &AntiBlockEngine {
        &self.blocklist
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Fetches currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn fetch(
        &self,
        url: &str,
        extra_headers: Option<&HashMap<String, String>>,
        proxy_override: Option<&str>,
    ) -> Result<FetchResponse, CrawlError> {
        let canonical = trawler_catalog::canonicalize(url)?;
        let host = trawler_core::host_of(&canonical)
            .ok_or_else(|| CrawlError::InvalidUrl(canonical.clone()))?;

        if let Some(hit) = self.cache.get(&canonical) {
            return Ok(hit);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CrawlError::Transport("pipeline shut down".into()))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        self.limiter.acquire().await;

        let (lo, hi) = self.config.delay_range;
        if hi > 0.0 && hi >= lo {
            let politeness = rand::thread_rng().gen_range(lo..=hi);
            tokio::time::sleep(Duration::from_secs_f64(politeness)).await;
        }

        let host_delay = self.blocklist.pre_check(&host)?;
        tokio::time::sleep(host_delay).await;
        self.blocklist.record_request(&host);

        let headers = self.build_headers(extra_headers);

        let (client, proxy_url) = if let Some(proxy) = proxy_override {
            (build_client(&self.config, Some(proxy))?, Some(proxy.to_string()))
        } else if let Some(pool) = &self.proxies {
            match pool.next() {
                Some(url) => match self.proxy_clients.get(&url) {
                    Some(client) => (client.clone(), Some(url)),
                    None => (self.client.clone(), None),
                },
                None => (self.client.clone(), None),
            }
        } else {
            (self.client.clone(), None)
        };

        let attempts = self.config.retry_times.max(1);
        for attempt in 0..attempts {
            let started = Instant::now();
            let transport_err = match client.get(&canonical).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let final_url = resp.url().to_string();
                    let mut resp_headers = HashMap::new();
                    for (name, value) in resp.headers() {
                        if let Ok(text) = value.to_str() {
                            resp_headers.insert(name.as_str().to_lowercase(), text.to_string());
                        }
                    }
                    let cookies = parse_cookies(resp.headers());
                    match resp.bytes().await {
                        Ok(body) => {
                            let body = body.to_vec();
                            match AntiBlockEngine::classify(status, &resp_headers, &body) {
                                Some(BlockSignal::Blocked) => {
                                    self.blocklist.record_blocked(&host);
                                    return Err(CrawlError::Blocked(host));
                                }
                                Some(BlockSignal::RateLimited) => {
                                    self.blocklist.record_rate_limited(&host);
                                    return Err(CrawlError::RateLimited(host));
                                }
                                None => {}
                            }
                            if !(200..300).contains(&status) {
                                return Err(CrawlError::Http(status));
                            }
                            self.blocklist.record_success(&host);
                            if let (Some(pool), Some(proxy)) = (&self.proxies, &proxy_url) {
                                pool.mark_success(proxy);
                            }
                            let content_type = resp_headers.get("content-type").cloned();
                            let encoding = content_type.as_deref().and_then(charset_of);
                            let response = FetchResponse {
                                url: final_url,
                                status,
                                headers: resp_headers,
                                body,
                                content_type,
                                encoding,
                                cookies,
                                elapsed: started.elapsed(),
                                fetched_at: chrono::Utc::now(),
                            };
                            self.cache.put(&canonical, response.clone());
                            return Ok(response);
                        }
                        Err(e) => e.to_string(),
                    }
                }
                Err(e) => e.to_string(),
            };

            if attempt + 1 == attempts {
                if let (Some(pool), Some(proxy)) = (&self.proxies, &proxy_url) {
                    pool.mark_bad(
                        proxy,
                        Duration::from_secs(self.config.proxy_rotation_interval_seconds),
                    );
                }
                return Err(CrawlError::Transport(transport_err));
            }
            warn!(url = %canonical, attempt, error = %transport_err, "transport error, backing off");
            tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
        }
        Err(CrawlError::Transport("retry attempts exhausted".into()))
    }

    /// Baseline headers, then a rotated User-Agent, then caller headers last
    /// so they win every collision.
    fn build_headers(&self, extra: Option<&HashMap<String, String>>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(self.agents.pick()),
        );
        if let Some(extra) = extra {
            for (name, value) in extra {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => debug!(header = %name, "dropping malformed caller header"),
                }
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_config() -> DownloadConfig {
        DownloadConfig {
            delay_range: (0.0, 0.0),
            cache_ttl_seconds: 0,
            ..DownloadConfig::default()
        }
    }

    fn pipeline(config: DownloadConfig) -> FetchPipeline {
        FetchPipeline::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_2xx_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body>hello there</body></html>")
            .create_async()
            .await;

        let pipe = pipeline(test_config());
        let resp = pipe
            .fetch(&format!("{}/page", server.url()), None, None)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.encoding.as_deref(), Some("utf-8"));
        assert!(String::from_utf8_lossy(&resp.body).contains("hello there"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_block_page_penalises_host() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/denied")
            .with_status(403)
            .with_body("<html>Access Denied</html>")
            .create_async()
            .await;

        let pipe = pipeline(test_config());
        let err = pipe
            .fetch(&format!("{}/denied", server.url()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Blocked(_)));

        let host = trawler_core::host_of(&server.url()).unwrap();
        assert_eq!(
            pipe.blocklist().state(&host),
            crate::antiblock::HostState::Penalised
        );
        // penalty window is at least five minutes
        assert!(pipe.blocklist().blocked_for(&host).unwrap() >= Duration::from_secs(299));

        // further fetches fail at the pre-check without touching the server
        let err = pipe
            .fetch(&format!("{}/denied", server.url()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::DomainBlocked(_)));
    }

    #[tokio::test]
    async fn test_429_throttles_host() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/busy")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let pipe = pipeline(test_config());
        let err = pipe
            .fetch(&format!("{}/busy", server.url()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::RateLimited(_)));

        let host = trawler_core::host_of(&server.url()).unwrap();
        assert_eq!(
            pipe.blocklist().state(&host),
            crate::antiblock::HostState::Throttled
        );
        // default 1s delay doubled
        assert_eq!(pipe.blocklist().delay(&host), Some(Duration::from_secs(2)));
        let pause = pipe.blocklist().blocked_for(&host).unwrap();
        assert!(pause >= Duration::from_secs(59) && pause <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_plain_404_is_http_error_not_block() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("<html>nothing here</html>")
            .create_async()
            .await;

        let pipe = pipeline(test_config());
        let err = pipe
            .fetch(&format!("{}/missing", server.url()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Http(404)));
        let host = trawler_core::host_of(&server.url()).unwrap();
        assert_eq!(
            pipe.blocklist().state(&host),
            crate::antiblock::HostState::Normal
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_up_front() {
        let pipe = pipeline(test_config());
        let err = pipe.fetch("ftp://a.test/file", None, None).await.unwrap_err();
        assert!(matches!(err, CrawlError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_caller_headers_override_baseline() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api")
            .match_header("accept", "application/json")
            .match_header("x-crawl-run", "7")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let pipe = pipeline(test_config());
        let mut extra = HashMap::new();
        extra.insert("Accept".to_string(), "application/json".to_string());
        extra.insert("X-Crawl-Run".to_string(), "7".to_string());
        pipe.fetch(&format!("{}/api", server.url()), Some(&extra), None)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_fetches() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cached")
            .with_status(200)
            .with_body("<html>v1</html>")
            .expect(1)
            .create_async()
            .await;

        let config = DownloadConfig {
            delay_range: (0.0, 0.0),
            cache_ttl_seconds: 3600,
            ..DownloadConfig::default()
        };
        let pipe = pipeline(config);
        let url = format!("{}/cached", server.url());
        let first = pipe.fetch(&url, None, None).await.unwrap();
        let second = pipe.fetch(&url, None, None).await.unwrap();
        assert_eq!(first.body, second.body);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_after_backoff() {
        let config = DownloadConfig {
            retry_times: 2,
            delay_range: (0.0, 0.0),
            cache_ttl_seconds: 0,
            request_timeout_seconds: 2,
            ..DownloadConfig::default()
        };
        let pipe = pipeline(config);
        let start = Instant::now();
        // nothing listens on port 9
        let err = pipe.fetch("http://127.0.0.1:9/", None, None).await.unwrap_err();
        assert!(matches!(err, CrawlError::Transport(_)));
        // one back-off of 2^0 seconds between the two attempts
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_retry_times_means_single_attempt() {
        let config = DownloadConfig {
            retry_times: 0,
            delay_range: (0.0, 0.0),
            cache_ttl_seconds: 0,
            request_timeout_seconds: 2,
            ..DownloadConfig::default()
        };
        let pipe = pipeline(config);
        let start = Instant::now();
        let err = pipe.fetch("http://127.0.0.1:9/", None, None).await.unwrap_err();
        assert!(matches!(err, CrawlError::Transport(_)));
        // no back-off sleep happened
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_max_concurrent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/slow")
            .with_status(200)
            .with_body("ok")
            .expect_at_least(3)
            .create_async()
            .await;

        let config = DownloadConfig {
            max_concurrent: 2,
            // politeness sleep keeps each permit held long enough to observe
            delay_range: (0.2, 0.2),
            cache_ttl_seconds: 0,
            ..DownloadConfig::default()
        };
        let pipe = Arc::new(pipeline(config));
        let url = format!("{}/slow", server.url());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pipe = Arc::clone(&pipe);
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                pipe.fetch(&url, None, None).await
            }));
        }

        let mut peak = 0;
        for _ in 0..60 {
            peak = peak.max(pipe.in_flight());
            assert!(pipe.in_flight() <= 2, "admission gate exceeded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak >= 1);
    }
}

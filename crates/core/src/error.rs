use thiserror::Error;

/// Every failure the crawl pipeline can surface. The worker loop matches on
/// these instead of catching exceptions: only `Transport` is retried (inside
/// the fetch pipeline), everything else is reported and the worker moves on.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {0}")]
    Http(u16),

    #[error("domain {0} is in block cooldown")]
    DomainBlocked(String),

    #[error("blocked by {0}")]
    Blocked(String),

    #[error("rate limited by {0}")]
    RateLimited(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Stable tag carried on failure result records and metric labels.
    pub fn tag(&self) -> &'static str {
        match self {
            CrawlError::Transport(_) => "transport_error",
            CrawlError::Http(_) => "http_error",
            CrawlError::DomainBlocked(_) => "domain_blocked",
            CrawlError::Blocked(_) => "blocked",
            CrawlError::RateLimited(_) => "rate_limited",
            CrawlError::InvalidUrl(_) => "invalid_url",
            CrawlError::Parse(_) => "parse_error",
            CrawlError::Storage(_) => "storage_error",
            CrawlError::Broker(_) => "broker_error",
            CrawlError::Config(_) => "config_error",
            CrawlError::Proxy(_) => "proxy_error",
            CrawlError::Other(_) => "other",
        }
    }

    /// Only transport failures are worth another attempt at the same URL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::Transport(_))
    }
}

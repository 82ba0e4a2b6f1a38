use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;

use trawler_core::{Broker, CrawlError};

use crate::bloom::ScalableBloomFilter;

/// Membership over URL fingerprints. Implementations may be exact or
/// probabilistic; callers must tolerate false positives (a URL skipped that
/// was never actually seen), never false negatives.
#[async_trait]
pub trait SeenSet: Send + Sync + 'static {
    async fn mark(&self, fingerprint: &str) -> Result<(), CrawlError>;
    async fn contains(&self, fingerprint: &str) -> Result<bool, CrawlError>;
}

/// Exact in-process set. Used by standalone mode and tests, where a single
/// process owns the whole crawl.
#[derive(Default)]
pub struct ExactSeenSet {
    fingerprints: DashSet<String>,
}

impl ExactSeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

#[async_trait]
impl SeenSet for ExactSeenSet {
    async fn mark(&self, fingerprint: &str) -> Result<(), CrawlError> {
        self.fingerprints.insert(fingerprint.to_string());
        Ok(())
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool, CrawlError> {
        Ok(self.fingerprints.contains(fingerprint))
    }
}

/// Broker-held probabilistic set for deployments with many URLs.
pub struct BloomSeenSet {
    filter: ScalableBloomFilter,
}

impl BloomSeenSet {
    pub fn new(
        broker: Arc<dyn Broker>,
        key: impl Into<String>,
        capacity: usize,
        error_rate: f64,
        scale_factor: usize,
    ) -> Self {
        Self {
            filter: ScalableBloomFilter::new(broker, key, capacity, error_rate, scale_factor),
        }
    }
}

#[async_trait]
impl SeenSet for BloomSeenSet {
    async fn mark(&self, fingerprint: &str) -> Result<(), CrawlError> {
        self.filter.add(fingerprint).await
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool, CrawlError> {
        self.filter.contains(fingerprint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_seen_set_membership() {
        let seen = ExactSeenSet::new();
        assert!(!seen.contains("abc").await.unwrap());
        seen.mark("abc").await.unwrap();
        assert!(seen.contains("abc").await.unwrap());
        assert!(!seen.contains("def").await.unwrap());
    }
}

pub mod bloom;
pub mod canonical;
pub mod seen;

pub use canonical::{canonicalize, canonicalize_with, fingerprint, is_internal, resolve};
pub use seen::{BloomSeenSet, ExactSeenSet, SeenSet};

use std::sync::Arc;

use dashmap::DashSet;

use trawler_core::{Broker, CrawlError, DomainStats};

/// Process-local front for URL identity: canonical form, seen-set membership
/// (with a local fingerprint cache in front of the broker-held set) and
/// per-domain stats kept in the broker's stats hashes.
pub struct UrlCatalog {
    broker: Arc<dyn Broker>,
    seen: Arc<dyn SeenSet>,
    stats_key: String,
    local: DashSet<String>,
}

impl UrlCatalog {
    pub fn new(broker: Arc<dyn Broker>, seen: Arc<dyn SeenSet>, stats_key: &str) -> Self {
        Self {
            broker,
            seen,
            stats_key: stats_key.to_string(),
            local: DashSet::new(),
        }
    }

    pub async fn is_visited(&self, url: &str) -> Result<bool, CrawlError> {
        let fp = fingerprint(url)?;
        if self.local.contains(&fp) {
            return Ok(true);
        }
        self.seen.contains(&fp).await
    }

    pub async fn mark_visited(&self, url: &str) -> Result<(), CrawlError> {
        let fp = fingerprint(url)?;
        self.seen.mark(&fp).await?;
        self.local.insert(fp);
        Ok(())
    }

    /// Folds one request outcome into the domain's shared counters.
    pub async fn update_domain_stats(
        &self,
        domain: &str,
        success: bool,
        response_time: f64,
        bytes: u64,
    ) -> Result<(), CrawlError> {
        let key = format!("{}:{domain}", self.stats_key);
        let fields = self.broker.hash_get_all(&key).await?;
        let mut stats = DomainStats::from_fields(&fields);
        stats.record(success, response_time, bytes);
        for (field, value) in stats.to_fields() {
            self.broker.hash_set(&key, &field, &value).await?;
        }
        Ok(())
    }

    pub async fn domain_stats(&self, domain: &str) -> Result<DomainStats, CrawlError> {
        let key = format!("{}:{domain}", self.stats_key);
        let fields = self.broker.hash_get_all(&key).await?;
        Ok(DomainStats::from_fields(&fields))
    }
}

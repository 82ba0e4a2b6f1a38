use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use trawler_core::{Broker, CrawlError};

/// Bloom filter whose bit array lives in the broker, shared by every worker
/// through its atomic bit operations. Bit count and hash count are derived
/// from the target capacity and false-positive rate.
pub struct BloomFilter {
    key: String,
    capacity: usize,
    num_bits: u64,
    num_hashes: u32,
    broker: Arc<dyn Broker>,
}

pub(crate) fn optimal_bits(capacity: usize, error_rate: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    (-(capacity as f64) * error_rate.ln() / (ln2 * ln2)).ceil() as u64
}

pub(crate) fn optimal_hashes(num_bits: u64, capacity: usize) -> u32 {
    let k = (num_bits as f64 / capacity as f64) * std::f64::consts::LN_2;
    (k.ceil() as u32).max(1)
}

/// One md5 derivation per hash index: position_i = md5("item_i") mod m.
pub(crate) fn derive_positions(item: &str, num_hashes: u32, num_bits: u64) -> Vec<u64> {
    (0..num_hashes)
        .map(|i| {
            let digest = md5::compute(format!("{item}_{i}").as_bytes());
            (u128::from_be_bytes(digest.0) % num_bits as u128) as u64
        })
        .collect()
}

impl BloomFilter {
    pub fn new(
        broker: Arc<dyn Broker>,
        key: impl Into<String>,
        capacity: usize,
        error_rate: f64,
    ) -> Self {
        let num_bits = optimal_bits(capacity, error_rate);
        let num_hashes = optimal_hashes(num_bits, capacity);
        Self {
            key: key.into(),
            capacity,
            num_bits,
            num_hashes,
            broker,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub async fn add(&self, item: &str) -> Result<(), CrawlError> {
        for position in derive_positions(item, self.num_hashes, self.num_bits) {
            self.broker.set_bit(&self.key, position, true).await?;
        }
        Ok(())
    }

    pub async fn contains(&self, item: &str) -> Result<bool, CrawlError> {
        for position in derive_positions(item, self.num_hashes, self.num_bits) {
            if !self.broker.get_bit(&self.key, position).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A list of Bloom filters with geometric capacity growth. `add` writes every
/// filter, `contains` ORs across them, so the false-positive rate stays
/// bounded per filter while capacity grows without a rebuild. False negatives
/// remain impossible.
pub struct ScalableBloomFilter {
    broker: Arc<dyn Broker>,
    key_prefix: String,
    initial_capacity: usize,
    error_rate: f64,
    scale_factor: usize,
    filters: RwLock<Vec<BloomFilter>>,
    newest_fill: AtomicU64,
}

impl ScalableBloomFilter {
    pub fn new(
        broker: Arc<dyn Broker>,
        key_prefix: impl Into<String>,
        initial_capacity: usize,
        error_rate: f64,
        scale_factor: usize,
    ) -> Self {
        let key_prefix = key_prefix.into();
        let first = BloomFilter::new(
            Arc::clone(&broker),
            format!("{key_prefix}:0"),
            initial_capacity,
            error_rate,
        );
        Self {
            broker,
            key_prefix,
            initial_capacity,
            error_rate,
            scale_factor: scale_factor.max(2),
            filters: RwLock::new(vec![first]),
            newest_fill: AtomicU64::new(0),
        }
    }

    pub async fn add(&self, item: &str) -> Result<(), CrawlError> {
        let newest_capacity = {
            let filters = self.filters.read().await;
            for filter in filters.iter() {
                filter.add(item).await?;
            }
            filters[filters.len() - 1].capacity() as u64
        };

        // Grow once the newest filter has admitted its capacity worth of items.
        if self.newest_fill.fetch_add(1, Ordering::SeqCst) + 1 >= newest_capacity {
            let mut filters = self.filters.write().await;
            let generation = filters.len();
            let capacity = self.initial_capacity * self.scale_factor.pow(generation as u32);
            debug!(generation, capacity, "growing scalable bloom filter");
            filters.push(BloomFilter::new(
                Arc::clone(&self.broker),
                format!("{}:{generation}", self.key_prefix),
                capacity,
                self.error_rate,
            ));
            self.newest_fill.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn contains(&self, item: &str) -> Result<bool, CrawlError> {
        let filters = self.filters.read().await;
        for filter in filters.iter() {
            if filter.contains(item).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn generations(&self) -> usize {
        self.filters.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_math() {
        // n = 1_000_000, p = 0.01 -> m = ceil(-n ln p / (ln 2)^2), k = ceil((m/n) ln 2)
        let bits = optimal_bits(1_000_000, 0.01);
        assert_eq!(bits, 9_585_059);
        assert_eq!(optimal_hashes(bits, 1_000_000), 7);
    }

    #[test]
    fn test_positions_are_deterministic_and_bounded() {
        let a = derive_positions("http://a.test/", 7, 1024);
        let b = derive_positions("http://a.test/", 7, 1024);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|&p| p < 1024));

        let other = derive_positions("http://b.test/", 7, 1024);
        assert_ne!(a, other);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CrawlError;
use crate::types::{Task, TaskReport};

/// Contract the crawl core holds against the shared broker process.
///
/// The broker owns the durable queues and the seen-set; workers only ever
/// hold in-flight tasks. Every operation is atomic on the broker side.
/// Queues are FIFO within themselves (push at head, pop from tail) but there
/// is no cross-queue ordering and no exactly-once delivery: workers tolerate
/// rare duplicates by checking the seen-set before fetching.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn push_task(&self, task: &Task) -> Result<(), CrawlError>;

    /// Pops the oldest task, or `None` when the queue is empty. Never blocks
    /// indefinitely; callers poll.
    async fn pop_task(&self) -> Result<Option<Task>, CrawlError>;

    async fn push_result(&self, report: &TaskReport) -> Result<(), CrawlError>;

    async fn pop_result(&self) -> Result<Option<TaskReport>, CrawlError>;

    async fn queue_size(&self) -> Result<u64, CrawlError>;

    /// Bitwise operations backing the Bloom-filter seen-set.
    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<(), CrawlError>;

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, CrawlError>;

    /// Hash operations backing shared stats.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CrawlError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CrawlError>;
}

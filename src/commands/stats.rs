use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use trawler_broker::RedisBroker;
use trawler_core::{AppConfig, Broker};
use trawler_storage::open_storage;

/// Entry point for `trawler stats`: one-shot snapshot of broker queues,
/// published master aggregates and the storage back-end.
pub async fn run(config: AppConfig) -> Result<()> {
    match RedisBroker::connect(&config.broker).await {
        Ok(broker) => {
            let broker: Arc<dyn Broker> = Arc::new(broker);
            let queue_size = broker.queue_size().await?;
            info!(queue_size, "task queue");

            let published = broker.hash_get_all(&config.broker.stats_key).await?;
            if published.is_empty() {
                info!("no aggregate stats published yet");
            }
            for (field, value) in published {
                info!(source = %field, stats = %value, "aggregate");
            }
        }
        Err(e) => warn!(error = %e, "broker unreachable, skipping queue stats"),
    }

    match open_storage(&config.storage).await {
        Ok(storage) => {
            let pages = storage.count(None).await?;
            info!(
                backend = storage.storage_type().as_str(),
                pages, "storage"
            );
            storage.disconnect().await?;
        }
        Err(e) => warn!(error = %e, "storage unreachable"),
    }
    Ok(())
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use trawler_broker::RedisBroker;
use trawler_catalog::{BloomSeenSet, SeenSet, UrlCatalog};
use trawler_core::{AppConfig, Broker, Task};

use crate::metrics::Metrics;

#[derive(Debug, Default)]
struct MasterStats {
    seeded: u64,
    completed: u64,
    failed: u64,
}

/// Entry point for `trawler master`: inject seeds, then drain the result
/// queue and publish aggregate stats until ctrl-c.
pub async fn run(config: AppConfig, seed_urls: Vec<String>) -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker).await?);
    let seen: Arc<dyn SeenSet> = Arc::new(BloomSeenSet::new(
        Arc::clone(&broker),
        config.broker.bloom_key.as_str(),
        config.seen.capacity,
        config.seen.error_rate,
        config.seen.scale_factor,
    ));
    let catalog = Arc::new(UrlCatalog::new(
        Arc::clone(&broker),
        seen,
        &config.broker.stats_key,
    ));
    let metrics = Arc::new(Metrics::new()?);

    let mut stats = MasterStats::default();
    stats.seeded = seed(&broker, &catalog, &seed_urls).await;
    if stats.seeded == 0 && seed_urls.is_empty() {
        warn!("no seed URLs given, master will only aggregate results");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let monitor = {
        let broker = Arc::clone(&broker);
        let stats_key = config.broker.stats_key.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            monitor_results(broker, &stats_key, metrics, stats, stop_rx).await;
        })
    };

    info!("master running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);
    let _ = monitor.await;
    info!("master stopped");
    Ok(())
}

/// Canonicalizes and enqueues seed URLs, skipping ones already crawled.
async fn seed(broker: &Arc<dyn Broker>, catalog: &UrlCatalog, urls: &[String]) -> u64 {
    let mut added = 0;
    for url in urls {
        let canonical = match trawler_catalog::canonicalize(url) {
            Ok(canonical) => canonical,
            Err(e) => {
                warn!(url = %url, error = %e, "skipping invalid seed");
                continue;
            }
        };
        match catalog.is_visited(&canonical).await {
            Ok(true) => {
                info!(url = %canonical, "seed already visited, skipping");
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                error!(url = %canonical, error = %e, "seen-set check failed");
                continue;
            }
        }
        match broker.push_task(&Task::seed(canonical.clone())).await {
            Ok(()) => {
                info!(url = %canonical, "seed enqueued");
                added += 1;
            }
            Err(e) => error!(url = %canonical, error = %e, "failed to enqueue seed"),
        }
    }
    info!(added, total = urls.len(), "seeding complete");
    added
}

/// Result drain loop, 1 s cadence: fold results into the aggregate, publish
/// to the broker stats hash, log once a minute.
async fn monitor_results(
    broker: Arc<dyn Broker>,
    stats_key: &str,
    metrics: Arc<Metrics>,
    mut stats: MasterStats,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut last_logged = Instant::now();
    loop {
        if *stop.borrow() {
            break;
        }

        loop {
            match broker.pop_result().await {
                Ok(Some(report)) => {
                    if report.success {
                        stats.completed += 1;
                    } else {
                        stats.failed += 1;
                        warn!(
                            url = %report.url,
                            worker = %report.worker_id,
                            error = report.error.as_deref().unwrap_or("unknown"),
                            "task failed"
                        );
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "result drain failed");
                    break;
                }
            }
        }

        let queue_size = broker.queue_size().await.unwrap_or(0);
        metrics.queue_size.set(queue_size as i64);
        metrics.update_memory_usage();

        let summary = json!({
            "seeded": stats.seeded,
            "completed_tasks": stats.completed,
            "failed_tasks": stats.failed,
            "queue_size": queue_size,
            "uptime_secs": started.elapsed().as_secs(),
        });
        if let Err(e) = broker
            .hash_set(stats_key, "master", &summary.to_string())
            .await
        {
            error!(error = %e, "failed to publish master stats");
        }

        if last_logged.elapsed() >= Duration::from_secs(60) {
            info!(
                completed = stats.completed,
                failed = stats.failed,
                queue_size,
                uptime_secs = started.elapsed().as_secs(),
                "master stats"
            );
            last_logged = Instant::now();
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = stop.changed() => {}
        }
    }
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "monitor stopped"
    );
}

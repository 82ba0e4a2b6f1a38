use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use trawler_broker::RedisBroker;
use trawler_catalog::{BloomSeenSet, SeenSet, UrlCatalog};
use trawler_core::{AppConfig, Broker, CrawlError, Page, Task, TaskReport};
use trawler_extract::ExtractorRegistry;
use trawler_fetch::FetchPipeline;
use trawler_storage::{open_storage, StorageSink};

use crate::metrics::Metrics;

#[derive(Debug, Default)]
struct WorkerStats {
    processed: u64,
    success: u64,
    failed: u64,
}

/// One crawl loop: pop, dedup, fetch, extract, persist, enqueue discovered
/// links, report. Every failure becomes a result record; nothing here is
/// fatal.
pub struct Worker {
    id: String,
    broker: Arc<dyn Broker>,
    catalog: Arc<UrlCatalog>,
    pipeline: Arc<FetchPipeline>,
    extractors: Arc<ExtractorRegistry>,
    storage: Arc<dyn StorageSink>,
    metrics: Arc<Metrics>,
    stats: WorkerStats,
    started: Instant,
}

impl Worker {
    pub fn new(
        id: String,
        broker: Arc<dyn Broker>,
        catalog: Arc<UrlCatalog>,
        pipeline: Arc<FetchPipeline>,
        extractors: Arc<ExtractorRegistry>,
        storage: Arc<dyn StorageSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            broker,
            catalog,
            pipeline,
            extractors,
            storage,
            metrics,
            stats: WorkerStats::default(),
            started: Instant::now(),
        }
    }

    pub async fn run(mut self, stop: watch::Receiver<bool>) {
        info!(worker = %self.id, "worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            let task = match self.broker.pop_task().await {
                Ok(task) => task,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "broker pop failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            let Some(task) = task else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            let task_started = Instant::now();
            if let Some(report) = self.process_task(task).await {
                let status = if report.success {
                    self.stats.success += 1;
                    "success"
                } else {
                    self.stats.failed += 1;
                    "failed"
                };
                self.metrics
                    .record_task(status, &self.id, task_started.elapsed().as_secs_f64());
                if let Err(e) = self.broker.push_result(&report).await {
                    error!(worker = %self.id, error = %e, "failed to push result");
                }
            }
            self.stats.processed += 1;
            if self.stats.processed % 10 == 0 {
                info!(
                    worker = %self.id,
                    processed = self.stats.processed,
                    success = self.stats.success,
                    failed = self.stats.failed,
                    uptime_secs = self.started.elapsed().as_secs(),
                    "rolling stats"
                );
            }
        }
        info!(worker = %self.id, processed = self.stats.processed, "worker stopped");
    }

    /// Runs one task to its terminal state. `None` means the task was a
    /// duplicate delivery and was dropped without a result record.
    pub async fn process_task(&self, mut task: Task) -> Option<TaskReport> {
        let url = task.url.clone();
        if !task.record_attempt() {
            warn!(worker = %self.id, url = %url, "task exhausted its attempt budget");
            return Some(TaskReport::failure(&task, &self.id, "max_attempts"));
        }
        debug!(worker = %self.id, url = %url, task_id = %task.id, "processing task");

        match self.catalog.is_visited(&url).await {
            Ok(true) => {
                debug!(worker = %self.id, url = %url, "already visited, dropping");
                return None;
            }
            Ok(false) => {}
            Err(e) => return Some(TaskReport::failure(&task, &self.id, e.tag())),
        }

        let domain = trawler_core::host_of(&url).unwrap_or_default();
        let headers = request_headers(&task);
        let fetch_started = Instant::now();
        let response = match self.pipeline.fetch(&url, headers.as_ref(), None).await {
            Ok(response) => response,
            Err(e) => {
                let status_label = match &e {
                    CrawlError::Http(status) => status.to_string(),
                    other => other.tag().to_string(),
                };
                self.metrics.record_request(
                    "GET",
                    &status_label,
                    &domain,
                    fetch_started.elapsed().as_secs_f64(),
                );
                if let Err(stats_err) = self
                    .catalog
                    .update_domain_stats(&domain, false, fetch_started.elapsed().as_secs_f64(), 0)
                    .await
                {
                    warn!(error = %stats_err, "domain stats update failed");
                }
                warn!(worker = %self.id, url = %url, error = %e, "fetch failed");
                return Some(TaskReport::failure(&task, &self.id, e.tag()));
            }
        };

        self.metrics.record_request(
            "GET",
            &response.status.to_string(),
            &domain,
            response.elapsed.as_secs_f64(),
        );

        if response.status != 200 {
            warn!(worker = %self.id, url = %url, status = response.status, "unexpected status");
            return Some(TaskReport::failure(&task, &self.id, "http_error"));
        }

        let parsed = match self
            .extractors
            .extract(&response.body, response.encoding.as_deref(), &url)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(worker = %self.id, url = %url, error = %e, "extraction failed");
                return Some(TaskReport::failure(&task, &self.id, e.tag()));
            }
        };

        let discovered: Vec<String> = parsed.all_links().cloned().collect();

        let mut page = Page::new(&url, response.status, response.body);
        page.content_type = response.content_type;
        page.encoding = response.encoding;
        page.headers = response.headers;
        page.fetched_at = response.fetched_at;
        page.title = parsed.title;
        page.metadata = parsed.metadata;
        page.structured_data = parsed.structured_data;
        page.text = parsed.text;
        page.internal_links = parsed.internal_links;
        page.external_links = parsed.external_links;
        page.artifact = parsed.artifact;
        page.worker_id = self.id.clone();
        page.download_time = response.elapsed.as_secs_f64();
        let bytes = page.content_size as u64;

        if let Err(e) = self.storage.save(&page.to_document(), None).await {
            error!(worker = %self.id, url = %url, error = %e, "save failed");
            return Some(TaskReport::failure(&task, &self.id, e.tag()));
        }

        if let Err(e) = self.catalog.mark_visited(&url).await {
            warn!(worker = %self.id, url = %url, error = %e, "mark_visited failed");
        }
        if let Err(e) = self
            .catalog
            .update_domain_stats(&domain, true, page.download_time, bytes)
            .await
        {
            warn!(error = %e, "domain stats update failed");
        }

        let mut enqueued = 0;
        for link in &discovered {
            match self.catalog.is_visited(link).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    debug!(link = %link, error = %e, "skipping link");
                    continue;
                }
            }
            if let Err(e) = self.broker.push_task(&Task::discovered(link, &url)).await {
                error!(link = %link, error = %e, "failed to enqueue link");
                continue;
            }
            enqueued += 1;
        }
        info!(worker = %self.id, url = %url, enqueued, "page processed");

        Some(TaskReport::success(&task, &self.id))
    }
}

/// Caller headers for the fetch: task headers plus any task cookies folded
/// into a Cookie header.
fn request_headers(task: &Task) -> Option<HashMap<String, String>> {
    if task.headers.is_empty() && task.cookies.is_empty() {
        return None;
    }
    let mut headers = task.headers.clone();
    if !task.cookies.is_empty() {
        let mut pairs: Vec<String> = task
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        pairs.sort();
        headers.insert("Cookie".to_string(), pairs.join("; "));
    }
    Some(headers)
}

/// Entry point for `trawler worker`: spawns the configured number of worker
/// loops against the shared broker and drains them on ctrl-c.
pub async fn run(config: AppConfig, worker_id: Option<String>, workers: usize) -> Result<()> {
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
    let pipeline = Arc::new(FetchPipeline::new(config.download.clone())?);
    let extractors = Arc::new(ExtractorRegistry::with_builtin_sites());
    let storage = open_storage(&config.storage).await?;
    let metrics = Arc::new(Metrics::new()?);

    let id_base = worker_id.unwrap_or_else(|| config.worker_id.clone());
    let workers = workers.max(1);
    metrics.workers_total.set(workers as i64);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let id = if workers == 1 {
            id_base.clone()
        } else {
            format!("{id_base}-{}", n + 1)
        };
        let worker = Worker::new(
            id,
            Arc::clone(&broker),
            Arc::clone(&catalog),
            Arc::clone(&pipeline),
            Arc::clone(&extractors),
            Arc::clone(&storage),
            Arc::clone(&metrics),
        );
        handles.push(tokio::spawn(worker.run(stop_rx.clone())));
    }
    info!(workers, "workers running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining workers");
    let _ = stop_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    storage.disconnect().await?;
    info!("shutdown complete");
    Ok(())
}

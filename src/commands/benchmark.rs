use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::info;

use trawler_core::AppConfig;
use trawler_fetch::FetchPipeline;

/// Entry point for `trawler benchmark`: fire `requests` GETs at one URL with
/// bounded concurrency and report throughput. Each request gets a distinct
/// query parameter so the pipeline's cache stays out of the measurement.
pub async fn run(
    config: AppConfig,
    url: String,
    requests: usize,
    concurrency: usize,
) -> Result<()> {
    info!(url = %url, requests, concurrency, "starting benchmark");

    let mut download = config.download.clone();
    download.cache_ttl_seconds = 0;
    download.delay_range = (0.0, 0.0);
    let pipeline = Arc::new(FetchPipeline::new(download)?);
    let gate = Arc::new(Semaphore::new(concurrency.max(1)));

    let started = Instant::now();
    let mut handles = Vec::with_capacity(requests);
    for n in 0..requests {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        let target = format!("{url}?test={n}");
        handles.push(tokio::spawn(async move {
            let _permit = gate.acquire().await;
            pipeline.fetch(&target, None, None).await.is_ok()
        }));
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(true) => succeeded += 1,
            _ => failed += 1,
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    let requests_per_second = if elapsed_secs > 0.0 {
        requests as f64 / elapsed_secs
    } else {
        0.0
    };
    let success_rate = succeeded as f64 / requests.max(1) as f64 * 100.0;
    info!(
        requests,
        succeeded,
        failed,
        elapsed_secs,
        requests_per_second,
        success_rate,
        "benchmark complete"
    );
    Ok(())
}

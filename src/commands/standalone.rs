use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use trawler_core::{AppConfig, Page};
use trawler_extract::ExtractorRegistry;
use trawler_fetch::FetchPipeline;
use trawler_storage::{open_storage, with_storage};

/// Entry point for `trawler standalone`: crawl a fixed URL list in-process
/// with no broker, persisting each page. Meant for debugging extractors and
/// storage wiring.
pub async fn run(config: AppConfig, urls: Vec<String>) -> Result<()> {
    let pipeline = FetchPipeline::new(config.download.clone())?;
    let extractors = ExtractorRegistry::with_builtin_sites();
    let storage = open_storage(&config.storage).await?;
    let worker_id = config.worker_id.clone();

    with_storage(Arc::clone(&storage), |storage| async move {
        for url in &urls {
            info!(url = %url, "downloading");
            let response = match pipeline.fetch(url, None, None).await {
                Ok(response) => response,
                Err(e) => {
                    error!(url = %url, error = %e, "fetch failed");
                    continue;
                }
            };
            let parsed =
                match extractors.extract(&response.body, response.encoding.as_deref(), url) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        error!(url = %url, error = %e, "extraction failed");
                        continue;
                    }
                };

            info!(
                url = %url,
                status = response.status,
                title = parsed.title.as_deref().unwrap_or("n/a"),
                bytes = response.body.len(),
                "fetched"
            );

            let mut page = Page::new(url, response.status, response.body);
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
            page.worker_id = worker_id.clone();
            page.download_time = response.elapsed.as_secs_f64();

            match storage.save(&page.to_document(), None).await {
                Ok(id) => info!(url = %url, id = %id, "page saved"),
                Err(e) => error!(url = %url, error = %e, "save failed"),
            }
        }
        Ok(())
    })
    .await?;
    Ok(())
}

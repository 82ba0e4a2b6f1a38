use std::collections::{HashMap, HashSet};

use scraper::{Html, Selector};
use tracing::trace;

use trawler_core::StructuredData;

pub struct HtmlResult {
    pub title: Option<String>,
    pub metadata: HashMap<String, String>,
    pub structured_data: StructuredData,
    pub text: String,
    pub internal_links: Vec<String>,
    pub external_links: Vec<String>,
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

pub fn parse_html(html_str: &str, base_url: &str) -> HtmlResult {
    let document = Html::parse_document(html_str);

    // Title
    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    // Meta tags: name, property or itemprop mapped to content, keys lowercased
    let mut metadata = HashMap::new();
    if let Some(title) = &title {
        metadata.insert("title".to_string(), title.clone());
    }
    if let Some(sel) = selector("meta") {
        for el in document.select(&sel) {
            let value = el.value();
            let name = value
                .attr("name")
                .or_else(|| value.attr("property"))
                .or_else(|| value.attr("itemprop"));
            if let (Some(name), Some(content)) = (name, value.attr("content")) {
                metadata.insert(name.to_lowercase(), content.trim().to_string());
            }
        }
    }

    // JSON-LD blocks; unparseable ones are skipped silently
    let mut structured_data = StructuredData::default();
    if let Some(sel) = selector(r#"script[type="application/ld+json"]"#) {
        for el in document.select(&sel) {
            let raw = el.text().collect::<String>();
            match serde_json::from_str(&raw) {
                Ok(value) => structured_data.json_ld.push(value),
                Err(_) => trace!(url = base_url, "skipping malformed json-ld block"),
            }
        }
    }

    // Flattened visible text
    let text = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let (internal_links, external_links) = extract_links(&document, base_url);

    HtmlResult {
        title,
        metadata,
        structured_data,
        text,
        internal_links,
        external_links,
    }
}

/// Anchor hrefs resolved against the page URL and partitioned by host
/// equality, deduplicated in first-seen order.
fn extract_links(document: &Html, base_url: &str) -> (Vec<String>, Vec<String>) {
    let Some(sel) = selector("a[href]") else {
        return (Vec::new(), Vec::new());
    };

    let mut seen = HashSet::new();
    let mut internal = Vec::new();
    let mut external = Vec::new();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        // Skip non-crawlable URL schemes
        if href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
            || href.starts_with('#')
        {
            continue;
        }
        let Some(resolved) = trawler_catalog::resolve(base_url, href) else {
            continue;
        };
        if !seen.insert(resolved.clone()) {
            continue;
        }
        if trawler_catalog::is_internal(base_url, &resolved) {
            internal.push(resolved);
        } else {
            external.push(resolved);
        }
    }
    (internal, external)
}

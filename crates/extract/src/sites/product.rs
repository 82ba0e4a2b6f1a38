use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;

use trawler_core::CrawlError;

use crate::html::parse_html;
use crate::{decode_body, Extractor, ParsedPage};

static PRODUCT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(products?|item|detail)(/|$|\?)").unwrap());

/// Typed artifact for product-catalog pages. Flows through the storage sink
/// untouched, next to the generic page fields.
#[derive(Debug, Default, Serialize)]
pub struct ProductRecord {
    pub name: Option<String>,
    pub sku: Option<String>,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub currency: Option<String>,
    pub stock_status: Option<String>,
    pub specifications: HashMap<String, String>,
}

impl ProductRecord {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.sku.is_none()
            && self.manufacturer.is_none()
            && self.price.is_none()
            && self.specifications.is_empty()
    }
}

/// Site extractor for product-catalog pages, selected by URL pattern.
pub struct ProductExtractor {
    pattern: Regex,
}

impl Default for ProductExtractor {
    fn default() -> Self {
        Self {
            pattern: PRODUCT_URL_RE.clone(),
        }
    }
}

impl ProductExtractor {
    pub fn with_pattern(pattern: Regex) -> Self {
        Self { pattern }
    }
}

fn select_text(document: &Html, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Ok(sel) = Selector::parse(raw) else {
            continue;
        };
        if let Some(el) = document.select(&sel).next() {
            let text = el.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn select_attr(document: &Html, raw: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(raw).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
}

fn extract_specifications(document: &Html) -> HashMap<String, String> {
    let mut specs = HashMap::new();
    let Ok(row_sel) = Selector::parse(".specifications tr, table.specs tr") else {
        return specs;
    };
    let Ok(key_sel) = Selector::parse("th, td.label") else {
        return specs;
    };
    let Ok(value_sel) = Selector::parse("td:not(.label)") else {
        return specs;
    };
    for row in document.select(&row_sel) {
        let key = row
            .select(&key_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string());
        let value = row
            .select(&value_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string());
        if let (Some(key), Some(value)) = (key, value) {
            if !key.is_empty() && !value.is_empty() {
                specs.insert(key, value);
            }
        }
    }
    specs
}

impl Extractor for ProductExtractor {
    fn name(&self) -> &str {
        "product"
    }

    fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    fn extract(
        &self,
        body: &[u8],
        encoding: Option<&str>,
        url: &str,
    ) -> Result<ParsedPage, CrawlError> {
        let decoded = decode_body(body, encoding);
        let generic = parse_html(&decoded, url);
        let document = Html::parse_document(&decoded);

        let record = ProductRecord {
            name: select_text(&document, &["h1.product-title", "[itemprop=\"name\"]", "h1"]),
            sku: select_text(&document, &[".product-number", "[itemprop=\"sku\"]", ".sku"]),
            manufacturer: select_text(
                &document,
                &[".manufacturer", "[itemprop=\"manufacturer\"]", "[itemprop=\"brand\"]"],
            ),
            description: generic
                .metadata
                .get("description")
                .cloned()
                .or_else(|| select_text(&document, &[".product-description"])),
            price: select_attr(&document, "[itemprop=\"price\"]", "content")
                .or_else(|| select_text(&document, &["[itemprop=\"price\"]", ".price"])),
            currency: select_attr(&document, "[itemprop=\"priceCurrency\"]", "content")
                .or_else(|| select_text(&document, &["[itemprop=\"priceCurrency\"]"])),
            stock_status: select_text(&document, &[".stock", ".availability", "[itemprop=\"availability\"]"]),
            specifications: extract_specifications(&document),
        };

        let artifact = if record.is_empty() {
            None
        } else {
            serde_json::to_value(&record).ok()
        };

        Ok(ParsedPage {
            title: generic.title,
            metadata: generic.metadata,
            structured_data: generic.structured_data,
            text: generic.text,
            internal_links: generic.internal_links,
            external_links: generic.external_links,
            artifact,
        })
    }
}

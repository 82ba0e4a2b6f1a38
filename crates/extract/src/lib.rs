pub mod decode;
pub mod html;
pub mod sites;

use std::collections::HashMap;

use trawler_core::{CrawlError, StructuredData};

pub use decode::decode_body;
pub use sites::product::ProductExtractor;

/// Everything pulled from one page body. The link partition is by host
/// equality with the page's own URL; `artifact` carries whatever typed
/// record a site extractor produced, opaque to the core.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub metadata: HashMap<String, String>,
    pub structured_data: StructuredData,
    pub text: String,
    pub internal_links: Vec<String>,
    pub external_links: Vec<String>,
    pub artifact: Option<serde_json::Value>,
}

impl ParsedPage {
    pub fn all_links(&self) -> impl Iterator<Item = &String> {
        self.internal_links.iter().chain(self.external_links.iter())
    }
}

/// Extraction seam. Site-specific extractors claim URLs by pattern and may
/// attach a typed artifact; the generic extractor takes everything else.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, url: &str) -> bool;

    fn extract(
        &self,
        body: &[u8],
        encoding: Option<&str>,
        url: &str,
    ) -> Result<ParsedPage, CrawlError>;
}

/// Default extractor: decode, then generic HTML field extraction.
#[derive(Default)]
pub struct GenericExtractor;

impl Extractor for GenericExtractor {
    fn name(&self) -> &str {
        "generic"
    }

    fn matches(&self, _url: &str) -> bool {
        true
    }

    fn extract(
        &self,
        body: &[u8],
        encoding: Option<&str>,
        url: &str,
    ) -> Result<ParsedPage, CrawlError> {
        let decoded = decode_body(body, encoding);
        let result = html::parse_html(&decoded, url);
        Ok(ParsedPage {
            title: result.title,
            metadata: result.metadata,
            structured_data: result.structured_data,
            text: result.text,
            internal_links: result.internal_links,
            external_links: result.external_links,
            artifact: None,
        })
    }
}

/// First matching site extractor wins; the generic one is the fallback.
pub struct ExtractorRegistry {
    sites: Vec<Box<dyn Extractor>>,
    generic: GenericExtractor,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            sites: Vec::new(),
            generic: GenericExtractor,
        }
    }

    /// Registry with the in-tree site extractors installed.
    pub fn with_builtin_sites() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ProductExtractor::default()));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.sites.push(extractor);
    }

    pub fn extractor_for(&self, url: &str) -> &dyn Extractor {
        self.sites
            .iter()
            .find(|e| e.matches(url))
            .map(|e| e.as_ref())
            .unwrap_or(&self.generic)
    }

    pub fn extract(
        &self,
        body: &[u8],
        encoding: Option<&str>,
        url: &str,
    ) -> Result<ParsedPage, CrawlError> {
        self.extractor_for(url).extract(body, encoding, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_handles_anything() {
        let registry = ExtractorRegistry::new();
        assert_eq!(registry.extractor_for("http://anything.test/x").name(), "generic");
    }

    #[test]
    fn test_site_extractor_claims_its_urls() {
        let registry = ExtractorRegistry::with_builtin_sites();
        assert_eq!(
            registry
                .extractor_for("http://shop.test/products/widget-9")
                .name(),
            "product"
        );
        assert_eq!(registry.extractor_for("http://shop.test/news").name(), "generic");
    }

    #[test]
    fn test_zero_length_body() {
        let registry = ExtractorRegistry::new();
        let parsed = registry.extract(b"", None, "http://a.test/").unwrap();
        assert!(parsed.title.is_none());
        assert!(parsed.text.is_empty());
        assert_eq!(parsed.all_links().count(), 0);
    }
}

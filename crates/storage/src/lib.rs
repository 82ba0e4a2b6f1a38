pub mod document;
pub mod file;
pub mod relational;

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use trawler_core::config::StorageConfig;
use trawler_core::CrawlError;

pub use document::SqliteStorage;
pub use file::FileStorage;
pub use relational::PostgresStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    File,
    Relational,
    DocumentStore,
    SearchIndex,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::Relational => "relational",
            StorageType::DocumentStore => "document-store",
            StorageType::SearchIndex => "search-index",
        }
    }
}

impl FromStr for StorageType {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(StorageType::File),
            "relational" => Ok(StorageType::Relational),
            "document-store" => Ok(StorageType::DocumentStore),
            "search-index" => Ok(StorageType::SearchIndex),
            other => Err(CrawlError::Config(format!("unknown storage type {other}"))),
        }
    }
}

/// Uniform contract over JSON documents. The crawl core only ever calls
/// `save`; the remaining operations exist for operators. Adapters keep no
/// state between operations apart from their connection or pool.
#[async_trait]
pub trait StorageSink: Send + Sync {
    fn storage_type(&self) -> StorageType;

    async fn connect(&self) -> Result<(), CrawlError>;

    async fn disconnect(&self) -> Result<(), CrawlError>;

    /// Persists one document and returns its id.
    async fn save(&self, doc: &Value, collection: Option<&str>) -> Result<String, CrawlError>;

    async fn save_batch(
        &self,
        docs: &[Value],
        collection: Option<&str>,
    ) -> Result<Vec<String>, CrawlError> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.save(doc, collection).await?);
        }
        Ok(ids)
    }

    async fn get(&self, id: &str, collection: Option<&str>) -> Result<Option<Value>, CrawlError>;

    /// Top-level field equality query.
    async fn find(
        &self,
        query: &HashMap<String, Value>,
        collection: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Value>, CrawlError>;

    /// Merges `patch` into the stored document. False when the id is unknown.
    async fn update(
        &self,
        id: &str,
        patch: &Value,
        collection: Option<&str>,
    ) -> Result<bool, CrawlError>;

    async fn delete(&self, id: &str, collection: Option<&str>) -> Result<bool, CrawlError>;

    async fn count(&self, collection: Option<&str>) -> Result<u64, CrawlError>;
}

/// Scoped acquisition: connect, run, and disconnect on both the success and
/// the error path.
pub async fn with_storage<F, Fut, T>(sink: Arc<dyn StorageSink>, f: F) -> Result<T, CrawlError>
where
    F: FnOnce(Arc<dyn StorageSink>) -> Fut,
    Fut: Future<Output = Result<T, CrawlError>>,
{
    sink.connect().await?;
    let result = f(Arc::clone(&sink)).await;
    let disconnected = sink.disconnect().await;
    let value = result?;
    disconnected?;
    Ok(value)
}

/// Builds and connects the configured back-end. The search-index adapter is
/// an external collaborator and is rejected here.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageSink>, CrawlError> {
    let sink: Arc<dyn StorageSink> = match StorageType::from_str(&config.storage_type)? {
        StorageType::File => Arc::new(FileStorage::new(&config.file_path)),
        StorageType::Relational => Arc::new(PostgresStorage::new(&config.postgres_url)),
        StorageType::DocumentStore => Arc::new(SqliteStorage::new(&config.sqlite_path)),
        StorageType::SearchIndex => {
            return Err(CrawlError::Config(
                "search-index storage is not built in; use file, relational or document-store"
                    .into(),
            ))
        }
    };
    sink.connect().await?;
    Ok(sink)
}

/// Document id plus the stamped copy that actually gets written: an absent
/// id becomes the md5 of the sorted-key serialization, so identical content
/// lands on the same key no matter which worker saves it.
pub(crate) fn prepare_document(doc: &Value, storage_type: StorageType) -> (String, Value) {
    let mut stamped = doc.clone();
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!("{:x}", md5::compute(doc.to_string().as_bytes()))
        });
    if let Some(map) = stamped.as_object_mut() {
        map.insert("id".into(), Value::String(id.clone()));
        map.insert(
            "_created_at".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        map.insert(
            "_storage_type".into(),
            Value::String(storage_type.as_str().to_string()),
        );
    }
    (id, stamped)
}

/// Equality match on top-level fields; an empty query matches everything.
pub(crate) fn matches_query(doc: &Value, query: &HashMap<String, Value>) -> bool {
    query
        .iter()
        .all(|(key, expected)| doc.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_type_parsing() {
        assert_eq!("file".parse::<StorageType>().unwrap(), StorageType::File);
        assert_eq!(
            "document-store".parse::<StorageType>().unwrap(),
            StorageType::DocumentStore
        );
        assert!(matches!(
            "carrier-pigeon".parse::<StorageType>(),
            Err(CrawlError::Config(_))
        ));
    }

    #[test]
    fn test_content_addressed_ids_are_stable() {
        let doc = json!({"url": "http://a.test/", "text": "hello"});
        let (id_a, _) = prepare_document(&doc, StorageType::File);
        let (id_b, _) = prepare_document(&doc, StorageType::File);
        assert_eq!(id_a, id_b);

        let other = json!({"url": "http://a.test/", "text": "different"});
        let (id_c, _) = prepare_document(&other, StorageType::File);
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn test_explicit_id_wins() {
        let doc = json!({"id": "abc123", "url": "http://a.test/"});
        let (id, stamped) = prepare_document(&doc, StorageType::File);
        assert_eq!(id, "abc123");
        assert_eq!(stamped["_storage_type"], "file");
        assert!(stamped["_created_at"].is_string());
    }

    #[test]
    fn test_query_matching() {
        let doc = json!({"domain": "a.test", "status_code": 200});
        let mut query = HashMap::new();
        assert!(matches_query(&doc, &query));
        query.insert("domain".to_string(), json!("a.test"));
        assert!(matches_query(&doc, &query));
        query.insert("status_code".to_string(), json!(404));
        assert!(!matches_query(&doc, &query));
    }
}

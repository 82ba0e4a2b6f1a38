use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use trawler_core::CrawlError;

use crate::{matches_query, prepare_document, StorageSink, StorageType};

/// Local file tree: one pretty-printed JSON per document, optionally nested
/// one directory per collection.
pub struct FileStorage {
    base: PathBuf,
}

impl FileStorage {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn dir_for(&self, collection: Option<&str>) -> PathBuf {
        match collection {
            Some(collection) => self.base.join(collection),
            None => self.base.clone(),
        }
    }

    fn path_for(&self, id: &str, collection: Option<&str>) -> PathBuf {
        self.dir_for(collection).join(format!("{id}.json"))
    }

    async fn list_documents(&self, collection: Option<&str>) -> Result<Vec<Value>, CrawlError> {
        let dir = self.dir_for(collection);
        let mut docs = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(docs),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(raw) = fs::read_to_string(&path).await {
                    if let Ok(doc) = serde_json::from_str(&raw) {
                        docs.push(doc);
                    }
                }
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl StorageSink for FileStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    async fn connect(&self) -> Result<(), CrawlError> {
        fs::create_dir_all(&self.base)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        info!(path = %self.base.display(), "file storage ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn save(&self, doc: &Value, collection: Option<&str>) -> Result<String, CrawlError> {
        let (id, stamped) = prepare_document(doc, StorageType::File);
        let dir = self.dir_for(collection);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        let path = self.path_for(&id, collection);
        let pretty = serde_json::to_string_pretty(&stamped)
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        fs::write(&path, pretty)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        debug!(path = %path.display(), "document saved");
        Ok(id)
    }

    async fn get(&self, id: &str, collection: Option<&str>) -> Result<Option<Value>, CrawlError> {
        let path = self.path_for(id, collection);
        match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CrawlError::Storage(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    async fn find(
        &self,
        query: &HashMap<String, Value>,
        collection: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Value>, CrawlError> {
        let docs = self.list_documents(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| matches_query(doc, query))
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn update(
        &self,
        id: &str,
        patch: &Value,
        collection: Option<&str>,
    ) -> Result<bool, CrawlError> {
        let Some(mut existing) = self.get(id, collection).await? else {
            return Ok(false);
        };
        if let (Some(existing_map), Some(patch_map)) =
            (existing.as_object_mut(), patch.as_object())
        {
            for (key, value) in patch_map {
                existing_map.insert(key.clone(), value.clone());
            }
            existing_map.insert(
                "_updated_at".into(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        let path = self.path_for(id, collection);
        let pretty = serde_json::to_string_pretty(&existing)
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        fs::write(&path, pretty)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(true)
    }

    async fn delete(&self, id: &str, collection: Option<&str>) -> Result<bool, CrawlError> {
        let path = self.path_for(id, collection);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    async fn count(&self, collection: Option<&str>) -> Result<u64, CrawlError> {
        Ok(self.list_documents(collection).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::with_storage;

    async fn storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.connect().await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let (_dir, storage) = storage().await;
        let doc = json!({"url": "http://a.test/", "domain": "a.test", "text": "hello"});
        let id = storage.save(&doc, None).await.unwrap();

        let loaded = storage.get(&id, None).await.unwrap().unwrap();
        assert_eq!(loaded["url"], "http://a.test/");
        assert_eq!(loaded["id"], Value::String(id));
        assert!(loaded["_created_at"].is_string());
    }

    #[tokio::test]
    async fn test_same_content_same_file() {
        let (_dir, storage) = storage().await;
        let doc = json!({"url": "http://a.test/", "text": "same"});
        let id_a = storage.save(&doc, None).await.unwrap();
        let id_b = storage.save(&doc, None).await.unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(storage.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_separate_directories() {
        let (_dir, storage) = storage().await;
        storage
            .save(&json!({"kind": "a"}), Some("pages"))
            .await
            .unwrap();
        storage
            .save(&json!({"kind": "b"}), Some("products"))
            .await
            .unwrap();
        assert_eq!(storage.count(Some("pages")).await.unwrap(), 1);
        assert_eq!(storage.count(Some("products")).await.unwrap(), 1);
        assert_eq!(storage.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_with_equality_query() {
        let (_dir, storage) = storage().await;
        storage
            .save(&json!({"domain": "a.test", "n": 1}), None)
            .await
            .unwrap();
        storage
            .save(&json!({"domain": "a.test", "n": 2}), None)
            .await
            .unwrap();
        storage
            .save(&json!({"domain": "b.test", "n": 3}), None)
            .await
            .unwrap();

        let mut query = HashMap::new();
        query.insert("domain".to_string(), json!("a.test"));
        let found = storage.find(&query, None, 10, 0).await.unwrap();
        assert_eq!(found.len(), 2);

        let limited = storage.find(&query, None, 1, 0).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let (_dir, storage) = storage().await;
        let id = storage
            .save(&json!({"url": "http://a.test/", "status": "new"}), None)
            .await
            .unwrap();

        assert!(storage
            .update(&id, &json!({"status": "seen"}), None)
            .await
            .unwrap());
        let loaded = storage.get(&id, None).await.unwrap().unwrap();
        assert_eq!(loaded["status"], "seen");
        assert_eq!(loaded["url"], "http://a.test/");
        assert!(loaded["_updated_at"].is_string());

        assert!(storage.delete(&id, None).await.unwrap());
        assert!(!storage.delete(&id, None).await.unwrap());
        assert!(storage.get(&id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_id_is_none_not_error() {
        let (_dir, storage) = storage().await;
        assert!(storage.get("nope", None).await.unwrap().is_none());
        assert!(!storage.update("nope", &json!({"x": 1}), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_scoped_acquisition_releases_on_error() {
        let dir = TempDir::new().unwrap();
        let sink: Arc<dyn StorageSink> = Arc::new(FileStorage::new(dir.path()));
        let result: Result<(), CrawlError> = with_storage(Arc::clone(&sink), |_s| async {
            Err(CrawlError::Storage("boom".into()))
        })
        .await;
        assert!(matches!(result, Err(CrawlError::Storage(_))));

        // sink still usable afterwards
        let ok = with_storage(sink, |s| async move {
            s.save(&json!({"fine": true}), None).await.map(|_| ())
        })
        .await;
        assert!(ok.is_ok());
    }
}

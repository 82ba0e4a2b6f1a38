use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

use trawler_core::CrawlError;

use crate::{matches_query, prepare_document, StorageSink, StorageType};

const DEFAULT_COLLECTION: &str = "pages";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT NOT NULL,
    collection TEXT NOT NULL,
    doc TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (id, collection)
);
CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection);
"#;

/// Document back-end over SQLite: whole JSON documents in a single table,
/// equality queries evaluated on the decoded document.
pub struct SqliteStorage {
    path: String,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, CrawlError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| CrawlError::Storage("sqlite storage is not connected".into()))
    }
}

fn storage_err(e: sqlx::Error) -> CrawlError {
    CrawlError::Storage(e.to_string())
}

#[async_trait]
impl StorageSink for SqliteStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::DocumentStore
    }

    async fn connect(&self) -> Result<(), CrawlError> {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CrawlError::Storage(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage_err)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(storage_err)?;
        info!(path = %self.path, "connected to sqlite storage");
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CrawlError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn save(&self, doc: &Value, collection: Option<&str>) -> Result<String, CrawlError> {
        let (id, stamped) = prepare_document(doc, StorageType::DocumentStore);
        let pool = self.pool().await?;
        sqlx::query(
            r#"INSERT OR REPLACE INTO documents (id, collection, doc, created_at)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(&id)
        .bind(collection.unwrap_or(DEFAULT_COLLECTION))
        .bind(stamped.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(storage_err)?;
        Ok(id)
    }

    async fn get(&self, id: &str, collection: Option<&str>) -> Result<Option<Value>, CrawlError> {
        let pool = self.pool().await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT doc FROM documents WHERE id = ?1 AND collection = ?2")
                .bind(id)
                .bind(collection.unwrap_or(DEFAULT_COLLECTION))
                .fetch_optional(&pool)
                .await
                .map_err(storage_err)?;
        match row {
            Some((raw,)) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CrawlError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn find(
        &self,
        query: &HashMap<String, Value>,
        collection: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Value>, CrawlError> {
        let pool = self.pool().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT doc FROM documents WHERE collection = ?1 ORDER BY created_at",
        )
        .bind(collection.unwrap_or(DEFAULT_COLLECTION))
        .fetch_all(&pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|(raw,)| serde_json::from_str::<Value>(&raw).ok())
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
        let pool = self.pool().await?;
        sqlx::query("UPDATE documents SET doc = ?3 WHERE id = ?1 AND collection = ?2")
            .bind(id)
            .bind(collection.unwrap_or(DEFAULT_COLLECTION))
            .bind(existing.to_string())
            .execute(&pool)
            .await
            .map_err(storage_err)?;
        Ok(true)
    }

    async fn delete(&self, id: &str, collection: Option<&str>) -> Result<bool, CrawlError> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1 AND collection = ?2")
            .bind(id)
            .bind(collection.unwrap_or(DEFAULT_COLLECTION))
            .execute(&pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self, collection: Option<&str>) -> Result<u64, CrawlError> {
        let pool = self.pool().await?;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE collection = ?1")
                .bind(collection.unwrap_or(DEFAULT_COLLECTION))
                .fetch_one(&pool)
                .await
                .map_err(storage_err)?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    async fn storage() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crawler.db");
        let storage = SqliteStorage::new(path.to_str().unwrap());
        storage.connect().await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_save_get_and_count() {
        let (_dir, storage) = storage().await;
        let id = storage
            .save(&json!({"url": "http://a.test/", "domain": "a.test"}), None)
            .await
            .unwrap();
        let loaded = storage.get(&id, None).await.unwrap().unwrap();
        assert_eq!(loaded["domain"], "a.test");
        assert_eq!(storage.count(None).await.unwrap(), 1);
        // replace, not duplicate
        storage
            .save(&json!({"url": "http://a.test/", "domain": "a.test"}), None)
            .await
            .unwrap();
        assert_eq!(storage.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_update_delete() {
        let (_dir, storage) = storage().await;
        storage.save(&json!({"domain": "a.test"}), None).await.unwrap();
        let id = storage.save(&json!({"domain": "b.test"}), None).await.unwrap();

        let mut query = HashMap::new();
        query.insert("domain".to_string(), json!("b.test"));
        let found = storage.find(&query, None, 10, 0).await.unwrap();
        assert_eq!(found.len(), 1);

        assert!(storage
            .update(&id, &json!({"flagged": true}), None)
            .await
            .unwrap());
        let loaded = storage.get(&id, None).await.unwrap().unwrap();
        assert_eq!(loaded["flagged"], true);

        assert!(storage.delete(&id, None).await.unwrap());
        assert_eq!(storage.count(None).await.unwrap(), 1);
    }
}

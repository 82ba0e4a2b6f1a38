use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use trawler_core::CrawlError;

use crate::{prepare_document, StorageSink, StorageType};

const DEFAULT_COLLECTION: &str = "pages";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT NOT NULL,
    collection TEXT NOT NULL,
    url TEXT,
    domain TEXT,
    status_code INT,
    doc JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (id, collection)
);
CREATE INDEX IF NOT EXISTS documents_domain_idx ON documents (domain);
CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection);
"#;

/// Relational back-end over Postgres. Documents land in one table with the
/// frequently-filtered columns lifted out and the full record in a JSONB
/// column.
pub struct PostgresStorage {
    url: String,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresStorage {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool, CrawlError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| CrawlError::Storage("postgres storage is not connected".into()))
    }
}

fn storage_err(e: sqlx::Error) -> CrawlError {
    CrawlError::Storage(e.to_string())
}

#[async_trait]
impl StorageSink for PostgresStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Relational
    }

    async fn connect(&self) -> Result<(), CrawlError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&self.url)
            .await
            .map_err(storage_err)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(storage_err)?;
        info!("connected to postgres storage");
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
        let (id, stamped) = prepare_document(doc, StorageType::Relational);
        let pool = self.pool().await?;
        let url = stamped.get("url").and_then(Value::as_str);
        let domain = stamped.get("domain").and_then(Value::as_str);
        let status_code = stamped
            .get("status_code")
            .and_then(Value::as_i64)
            .map(|s| s as i32);
        sqlx::query(
            r#"INSERT INTO documents (id, collection, url, domain, status_code, doc)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (id, collection) DO UPDATE SET doc = EXCLUDED.doc"#,
        )
        .bind(&id)
        .bind(collection.unwrap_or(DEFAULT_COLLECTION))
        .bind(url)
        .bind(domain)
        .bind(status_code)
        .bind(&stamped)
        .execute(&pool)
        .await
        .map_err(storage_err)?;
        Ok(id)
    }

    async fn get(&self, id: &str, collection: Option<&str>) -> Result<Option<Value>, CrawlError> {
        let pool = self.pool().await?;
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT doc FROM documents WHERE id = $1 AND collection = $2")
                .bind(id)
                .bind(collection.unwrap_or(DEFAULT_COLLECTION))
                .fetch_optional(&pool)
                .await
                .map_err(storage_err)?;
        Ok(row.map(|(doc,)| doc))
    }

    async fn find(
        &self,
        query: &HashMap<String, Value>,
        collection: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Value>, CrawlError> {
        let pool = self.pool().await?;
        let filter = Value::Object(query.clone().into_iter().collect());
        let rows: Vec<(Value,)> = sqlx::query_as(
            r#"SELECT doc FROM documents
               WHERE collection = $1 AND doc @> $2
               ORDER BY created_at
               LIMIT $3 OFFSET $4"#,
        )
        .bind(collection.unwrap_or(DEFAULT_COLLECTION))
        .bind(&filter)
        .bind(limit as i64)
        .bind(skip as i64)
        .fetch_all(&pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(|(doc,)| doc).collect())
    }

    async fn update(
        &self,
        id: &str,
        patch: &Value,
        collection: Option<&str>,
    ) -> Result<bool, CrawlError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            "UPDATE documents SET doc = doc || $3 WHERE id = $1 AND collection = $2",
        )
        .bind(id)
        .bind(collection.unwrap_or(DEFAULT_COLLECTION))
        .bind(patch)
        .execute(&pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str, collection: Option<&str>) -> Result<bool, CrawlError> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = $1 AND collection = $2")
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
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE collection = $1")
                .bind(collection.unwrap_or(DEFAULT_COLLECTION))
                .fetch_one(&pool)
                .await
                .map_err(storage_err)?;
        Ok(count as u64)
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;

use trawler_core::config::BrokerConfig;
use trawler_core::{Broker, CrawlError, Task, TaskReport};

/// Broker client over a shared Redis instance: `LPUSH`/`RPOP` lists for the
/// task and result queues, `SETBIT`/`GETBIT` bitmaps for the seen-set,
/// hashes for stats. The connection manager reconnects on its own; the
/// handle is cheap to clone per command.
pub struct RedisBroker {
    conn: ConnectionManager,
    task_queue: String,
    result_queue: String,
}

impl RedisBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, CrawlError> {
        let client = ::redis::Client::open(config.url())
            .map_err(|e| CrawlError::Broker(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CrawlError::Broker(e.to_string()))?;
        info!(host = %config.host, port = config.port, db = config.db, "connected to redis broker");
        Ok(Self {
            conn,
            task_queue: config.task_queue.clone(),
            result_queue: config.result_queue.clone(),
        })
    }
}

fn broker_err(e: ::redis::RedisError) -> CrawlError {
    CrawlError::Broker(e.to_string())
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_task(&self, task: &Task) -> Result<(), CrawlError> {
        let payload = serde_json::to_string(task).map_err(|e| CrawlError::Broker(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.task_queue, payload)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn pop_task(&self) -> Result<Option<Task>, CrawlError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .rpop(&self.task_queue, None)
            .await
            .map_err(broker_err)?;
        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CrawlError::Broker(e.to_string())),
            None => Ok(None),
        }
    }

    async fn push_result(&self, report: &TaskReport) -> Result<(), CrawlError> {
        let payload =
            serde_json::to_string(report).map_err(|e| CrawlError::Broker(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.result_queue, payload)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn pop_result(&self) -> Result<Option<TaskReport>, CrawlError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .rpop(&self.result_queue, None)
            .await
            .map_err(broker_err)?;
        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CrawlError::Broker(e.to_string())),
            None => Ok(None),
        }
    }

    async fn queue_size(&self) -> Result<u64, CrawlError> {
        let mut conn = self.conn.clone();
        conn.llen(&self.task_queue).await.map_err(broker_err)
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .setbit(key, offset as usize, value)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, CrawlError> {
        let mut conn = self.conn.clone();
        conn.getbit(key, offset as usize).await.map_err(broker_err)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CrawlError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await.map_err(broker_err)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CrawlError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(broker_err)
    }
}

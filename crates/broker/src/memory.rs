use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use trawler_core::{Broker, CrawlError, Task, TaskReport};

/// In-process broker with the same queue discipline as the Redis deployment:
/// push at the head, pop from the tail, JSON payloads, byte-addressed
/// bitmaps. Backs standalone mode and tests.
#[derive(Default)]
pub struct MemoryBroker {
    tasks: Mutex<VecDeque<String>>,
    results: Mutex<VecDeque<String>>,
    bits: Mutex<HashMap<String, Vec<u8>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, CrawlError> {
    serde_json::to_string(value).map_err(|e| CrawlError::Broker(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, CrawlError> {
    serde_json::from_str(payload).map_err(|e| CrawlError::Broker(e.to_string()))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_task(&self, task: &Task) -> Result<(), CrawlError> {
        self.tasks.lock().await.push_front(encode(task)?);
        Ok(())
    }

    async fn pop_task(&self) -> Result<Option<Task>, CrawlError> {
        match self.tasks.lock().await.pop_back() {
            Some(payload) => Ok(Some(decode(&payload)?)),
            None => Ok(None),
        }
    }

    async fn push_result(&self, report: &TaskReport) -> Result<(), CrawlError> {
        self.results.lock().await.push_front(encode(report)?);
        Ok(())
    }

    async fn pop_result(&self) -> Result<Option<TaskReport>, CrawlError> {
        match self.results.lock().await.pop_back() {
            Some(payload) => Ok(Some(decode(&payload)?)),
            None => Ok(None),
        }
    }

    async fn queue_size(&self) -> Result<u64, CrawlError> {
        Ok(self.tasks.lock().await.len() as u64)
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<(), CrawlError> {
        let mut bits = self.bits.lock().await;
        let bitmap = bits.entry(key.to_string()).or_default();
        let byte = (offset / 8) as usize;
        if bitmap.len() <= byte {
            bitmap.resize(byte + 1, 0);
        }
        let mask = 1u8 << (7 - (offset % 8));
        if value {
            bitmap[byte] |= mask;
        } else {
            bitmap[byte] &= !mask;
        }
        Ok(())
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, CrawlError> {
        let bits = self.bits.lock().await;
        let Some(bitmap) = bits.get(key) else {
            return Ok(false);
        };
        let byte = (offset / 8) as usize;
        if bitmap.len() <= byte {
            return Ok(false);
        }
        Ok(bitmap[byte] & (1 << (7 - (offset % 8))) != 0)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CrawlError> {
        self.hashes
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CrawlError> {
        Ok(self
            .hashes
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

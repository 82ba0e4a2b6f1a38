use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Seeds enqueue at `PRIORITY_HIGH`; discovered links at `PRIORITY_MEDIUM`.
pub const PRIORITY_HIGH: i32 = 10;
pub const PRIORITY_MEDIUM: i32 = 5;
pub const PRIORITY_LOW: i32 = 1;

pub fn epoch_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Host part of a URL: lowercased, leading `www.` stripped. This is the
/// identity used by the block-table, domain stats and the internal/external
/// link partition.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// An intent to fetch one URL, scheduled through the broker. The JSON layout
/// is the queue wire format shared with every other worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cookies: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "is_pending")]
    pub status: TaskStatus,
}

fn default_priority() -> i32 {
    PRIORITY_MEDIUM
}

fn default_max_attempts() -> u32 {
    3
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_pending(s: &TaskStatus) -> bool {
    *s == TaskStatus::Pending
}

impl Task {
    pub fn new(url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            priority,
            metadata: TaskMetadata::default(),
            timestamp: epoch_now(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            retry_count: 0,
            attempt_count: 0,
            max_attempts: default_max_attempts(),
            status: TaskStatus::Pending,
        }
    }

    pub fn seed(url: impl Into<String>) -> Self {
        let mut task = Self::new(url, PRIORITY_HIGH);
        task.metadata.kind = Some("seed".to_string());
        task
    }

    pub fn discovered(url: impl Into<String>, parent_url: &str) -> Self {
        let mut task = Self::new(url, PRIORITY_MEDIUM);
        task.metadata.parent_url = Some(parent_url.to_string());
        task
    }

    /// Records one processing attempt. Returns false once the attempt budget
    /// is exhausted; `attempt_count` never exceeds `max_attempts`.
    pub fn record_attempt(&mut self) -> bool {
        if self.attempt_count >= self.max_attempts {
            return false;
        }
        self.attempt_count += 1;
        self.status = TaskStatus::Processing;
        true
    }
}

/// Minimal record pushed to the result queue for the master's aggregation.
/// Not the durable artifact; that is [`Page`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub url: String,
    pub success: bool,
    pub worker_id: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskReport {
    pub fn success(task: &Task, worker_id: &str) -> Self {
        Self {
            task_id: task.id,
            url: task.url.clone(),
            success: true,
            worker_id: worker_id.to_string(),
            timestamp: epoch_now(),
            error: None,
        }
    }

    pub fn failure(task: &Task, worker_id: &str, error_tag: &str) -> Self {
        Self {
            task_id: task.id,
            url: task.url.clone(),
            success: false,
            worker_id: worker_id.to_string(),
            timestamp: epoch_now(),
            error: Some(error_tag.to_string()),
        }
    }
}

/// What the fetch pipeline hands back for a 2xx response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub encoding: Option<String>,
    pub cookies: HashMap<String, String>,
    pub elapsed: Duration,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_ld: Vec<serde_json::Value>,
}

/// The persisted fetch artifact for one successful response. Identity and
/// integrity fields (`id`, `domain`, `content_hash`, `content_size`) are
/// derived in [`Page::new`] so a stored record cannot disagree with its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub status_code: u16,
    #[serde(with = "body_bytes")]
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub content_hash: String,
    pub content_size: usize,
    pub encoding: Option<String>,
    pub headers: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub structured_data: StructuredData,
    pub text: String,
    #[serde(default)]
    pub internal_links: Vec<String>,
    #[serde(default)]
    pub external_links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
    pub worker_id: String,
    pub download_time: f64,
}

impl Page {
    pub fn new(url: &str, status_code: u16, content: Vec<u8>) -> Self {
        let content_hash = format!("{:x}", md5::compute(&content));
        let content_size = content.len();
        let domain = host_of(url).unwrap_or_default();
        Self {
            id: content_hash.clone(),
            url: url.to_string(),
            domain,
            status_code,
            content,
            content_type: None,
            content_hash,
            content_size,
            encoding: None,
            headers: HashMap::new(),
            fetched_at: Utc::now(),
            title: None,
            metadata: HashMap::new(),
            structured_data: StructuredData::default(),
            text: String::new(),
            internal_links: Vec::new(),
            external_links: Vec::new(),
            artifact: None,
            worker_id: String::new(),
            download_time: 0.0,
        }
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Body bytes travel base64-encoded inside JSON documents.
mod body_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Per-host rolling counters, shared across workers through the broker's
/// stats hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
    pub avg_response_time: f64,
    pub last_updated: i64,
}

impl DomainStats {
    /// Folds one request into the counters with an incremental mean update.
    pub fn record(&mut self, success: bool, response_time: f64, bytes: u64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_bytes += bytes;
        let n = self.total_requests as f64;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + response_time) / n;
        self.last_updated = Utc::now().timestamp();
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("total_requests".into(), self.total_requests.to_string()),
            (
                "successful_requests".into(),
                self.successful_requests.to_string(),
            ),
            ("failed_requests".into(), self.failed_requests.to_string()),
            ("total_bytes".into(), self.total_bytes.to_string()),
            (
                "avg_response_time".into(),
                self.avg_response_time.to_string(),
            ),
            ("last_updated".into(), self.last_updated.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let get_u64 = |k: &str| {
            fields
                .get(k)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            total_requests: get_u64("total_requests"),
            successful_requests: get_u64("successful_requests"),
            failed_requests: get_u64("failed_requests"),
            total_bytes: get_u64("total_bytes"),
            avg_response_time: fields
                .get("avg_response_time")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            last_updated: fields
                .get("last_updated")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0),
        }
    }
}

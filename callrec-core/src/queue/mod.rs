mod memory;
mod sqlite;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::RecordingPublisher;
pub use sqlite::{SqliteConversionQueue, SqliteConversionQueueBuilder};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on queue database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("receipt {0} is no longer valid")]
    StaleReceipt(String),
    #[error("malformed job body {body:?}")]
    MalformedJob { body: String },
    #[error("queue task failed: {0}")]
    Join(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl QueueError {
    /// Lock contention on the queue database clears up on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Execute(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            QueueError::Join(_) => true,
            _ => false,
        }
    }

    /// The queue itself is unusable; no later call will succeed either.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Open { .. } | QueueError::MissingStore)
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Request to convert one recording, identified by its object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub key: String,
}

impl ConversionJob {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn to_body(&self) -> String {
        serde_json::json!({ "key": self.key }).to_string()
    }

    /// Accepts `{"key": ...}` bodies and the older bare JSON string form.
    pub fn from_body(body: &str) -> QueueResult<Self> {
        let malformed = || QueueError::MalformedJob {
            body: body.to_string(),
        };
        let job = match serde_json::from_str::<serde_json::Value>(body).map_err(|_| malformed())? {
            serde_json::Value::Object(_) => {
                serde_json::from_str::<ConversionJob>(body).map_err(|_| malformed())?
            }
            serde_json::Value::String(key) => ConversionJob { key },
            _ => return Err(malformed()),
        };
        if job.key.trim().is_empty() {
            return Err(malformed());
        }
        Ok(job)
    }
}

/// Approximate counters, eventually consistent by contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub delayed: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.visible + self.delayed + self.in_flight
    }
}

/// A claimed message. Hidden from other receivers until acknowledged or
/// until its visibility timeout expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Handler failure reported to the failure destination.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub message_id: String,
    pub object_key: Option<String>,
    pub stage: String,
    pub error: String,
    pub receive_count: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, job: &ConversionJob, delay: Duration) -> QueueResult<String>;
}

#[async_trait]
pub trait DepthProbe: Send + Sync {
    async fn approximate_depth(&self) -> QueueResult<QueueDepth>;
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Claims at most one message.
    async fn receive(&self) -> QueueResult<Option<Delivery>>;

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()>;

    async fn report_failure(&self, failure: &FailureRecord) -> QueueResult<()>;
}

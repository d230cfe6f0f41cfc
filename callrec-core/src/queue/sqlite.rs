use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    ConversionJob, DeadLetter, Delivery, DepthProbe, FailureRecord, JobPublisher, JobSource,
    QueueDepth, QueueError, QueueResult,
};
use crate::config::QueueSection;
use crate::sqlite::configure_connection;

const QUEUE_SCHEMA: &str = include_str!("../../../sql/conversion_queue.sql");

#[derive(Debug, Clone)]
pub struct SqliteConversionQueueBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

impl Default for SqliteConversionQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            visibility_timeout: Duration::from_secs(90 * 60),
            max_receive_count: 5,
        }
    }
}

impl SqliteConversionQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_section(section: &QueueSection) -> Self {
        Self::new()
            .path(&section.path)
            .visibility_timeout(section.visibility_timeout())
            .max_receive_count(section.max_receive_count)
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn visibility_timeout(mut self, value: Duration) -> Self {
        self.visibility_timeout = value;
        self
    }

    /// Receives allowed before a message moves to the dead-letter table.
    pub fn max_receive_count(mut self, value: u32) -> Self {
        self.max_receive_count = value.max(1);
        self
    }

    pub fn build(self) -> QueueResult<SqliteConversionQueue> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteConversionQueue {
            path,
            flags,
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
        })
    }
}

/// Conversion queue with visibility timeouts, receive counting and a
/// dead-letter table, kept in one SQLite file shared by all processes.
#[derive(Debug, Clone)]
pub struct SqliteConversionQueue {
    path: PathBuf,
    flags: OpenFlags,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

impl SqliteConversionQueue {
    pub fn builder() -> SqliteConversionQueueBuilder {
        SqliteConversionQueueBuilder::new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> QueueResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !self.read_only_flags() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    fn read_only_flags(&self) -> bool {
        self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY)
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    /// Appends a message; it becomes receivable once `delay` has elapsed.
    pub fn send(&self, body: &str, delay: Duration) -> QueueResult<String> {
        let conn = self.open()?;
        let message_id = Uuid::new_v4().to_string();
        let now = now_millis();
        conn.execute(
            "INSERT INTO conversion_messages (message_id, body, sent_at, available_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![&message_id, body, now, now + duration_millis(delay)],
        )?;
        Ok(message_id)
    }

    /// Claims the oldest available message, dead-lettering any message whose
    /// receive count would exceed the configured maximum.
    pub fn receive_message(&self) -> QueueResult<Option<Delivery>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        loop {
            let candidate = tx
                .query_row(
                    "SELECT id, message_id, body, receive_count, sent_at
                     FROM conversion_messages
                     WHERE available_at <= ?1
                     ORDER BY available_at ASC, id ASC
                     LIMIT 1",
                    [now],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, message_id, body, receive_count, sent_at)) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            if receive_count >= self.max_receive_count {
                tx.execute(
                    "INSERT INTO conversion_dead_letters
                        (message_id, body, receive_count, sent_at, dead_lettered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![&message_id, &body, receive_count, sent_at, now],
                )?;
                tx.execute("DELETE FROM conversion_messages WHERE id = ?1", [id])?;
                warn!(message_id = %message_id, receive_count, "moved message to dead-letter queue");
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            let receive_count = receive_count + 1;
            tx.execute(
                "UPDATE conversion_messages
                 SET receive_count = ?1, receipt = ?2, available_at = ?3,
                     first_received_at = COALESCE(first_received_at, ?4)
                 WHERE id = ?5",
                params![
                    receive_count,
                    &receipt,
                    now + duration_millis(self.visibility_timeout),
                    now,
                    id
                ],
            )?;
            tx.commit()?;
            return Ok(Some(Delivery {
                message_id,
                receipt,
                body,
                receive_count,
            }));
        }
    }

    pub fn delete_message(&self, receipt: &str) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM conversion_messages WHERE receipt = ?1",
            [receipt],
        )?;
        if affected == 0 {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        }
        Ok(())
    }

    pub fn depth(&self) -> QueueResult<QueueDepth> {
        let conn = self.open()?;
        let now = now_millis();
        let depth = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN available_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN available_at > ?1 AND receive_count = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN available_at > ?1 AND receive_count > 0 THEN 1 ELSE 0 END), 0)
             FROM conversion_messages",
            [now],
            |row| {
                Ok(QueueDepth {
                    visible: row.get::<_, i64>(0)?.max(0) as u64,
                    delayed: row.get::<_, i64>(1)?.max(0) as u64,
                    in_flight: row.get::<_, i64>(2)?.max(0) as u64,
                })
            },
        )?;
        Ok(depth)
    }

    pub fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, body, receive_count, sent_at, dead_lettered_at
             FROM conversion_dead_letters ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(DeadLetter {
                message_id: row.get(0)?,
                body: row.get(1)?,
                receive_count: row.get(2)?,
                sent_at: from_millis(row.get(3)?),
                dead_lettered_at: from_millis(row.get(4)?),
            })
        })?;
        let mut letters = Vec::new();
        for row in rows {
            letters.push(row?);
        }
        Ok(letters)
    }

    pub fn insert_failure(&self, failure: &FailureRecord) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO conversion_failures
                (message_id, object_key, stage, error, receive_count, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &failure.message_id,
                &failure.object_key,
                &failure.stage,
                &failure.error,
                failure.receive_count,
                failure.failed_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn failures(&self, limit: usize) -> QueueResult<Vec<FailureRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, object_key, stage, error, receive_count, failed_at
             FROM conversion_failures ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(FailureRecord {
                message_id: row.get(0)?,
                object_key: row.get(1)?,
                stage: row.get(2)?,
                error: row.get(3)?,
                receive_count: row.get(4)?,
                failed_at: from_millis(row.get(5)?),
            })
        })?;
        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    /// Moves up to `limit` dead letters back onto the queue with a fresh
    /// receive count. Returns how many were moved.
    pub fn redrive(&self, limit: usize) -> QueueResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let letters: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, message_id, body FROM conversion_dead_letters ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for (id, message_id, body) in &letters {
            tx.execute(
                "INSERT INTO conversion_messages (message_id, body, sent_at, available_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![message_id, body, now],
            )?;
            tx.execute("DELETE FROM conversion_dead_letters WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        if !letters.is_empty() {
            info!(count = letters.len(), "redrove dead letters");
        }
        Ok(letters.len())
    }

    async fn blocking<T, F>(&self, operation: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteConversionQueue) -> QueueResult<T> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || operation(queue))
            .await
            .map_err(|err| QueueError::Join(err.to_string()))?
    }
}

#[async_trait]
impl JobPublisher for SqliteConversionQueue {
    async fn publish(&self, job: &ConversionJob, delay: Duration) -> QueueResult<String> {
        let body = job.to_body();
        self.blocking(move |queue| queue.send(&body, delay)).await
    }
}

#[async_trait]
impl DepthProbe for SqliteConversionQueue {
    async fn approximate_depth(&self) -> QueueResult<QueueDepth> {
        self.blocking(|queue| queue.depth()).await
    }
}

#[async_trait]
impl JobSource for SqliteConversionQueue {
    async fn receive(&self) -> QueueResult<Option<Delivery>> {
        self.blocking(|queue| queue.receive_message()).await
    }

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()> {
        let receipt = delivery.receipt.clone();
        self.blocking(move |queue| queue.delete_message(&receipt))
            .await
    }

    async fn report_failure(&self, failure: &FailureRecord) -> QueueResult<()> {
        let failure = failure.clone();
        self.blocking(move |queue| queue.insert_failure(&failure))
            .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 2)
}

fn from_millis(value: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(value).unwrap_or_default()
}

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EnqueueSection;
use crate::queue::{ConversionJob, JobPublisher, QueueError};
use crate::retry::{BackoffPolicy, ErrorClass};
use crate::storage::{ObjectStore, ObjectSummary, StorageError};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("failed to read tags of {key}: {source}")]
    Tags { key: String, source: StorageError },
    #[error("failed to publish job for {key}: {source}")]
    Publish { key: String, source: QueueError },
}

impl EnqueueError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            EnqueueError::Tags { source, .. } if source.is_transient() => ErrorClass::Transient,
            EnqueueError::Tags { .. } => ErrorClass::Ignorable,
            EnqueueError::Publish { source, .. } if source.is_fatal() => ErrorClass::Fatal,
            EnqueueError::Publish { source, .. } if source.is_transient() => ErrorClass::Transient,
            EnqueueError::Publish { .. } => ErrorClass::Ignorable,
        }
    }
}

/// A page that stopped at its first non-retryable error. `stats` counts
/// everything handled before the failing object.
#[derive(Debug, Error)]
#[error("{source} ({} enqueued before the failure)", stats.enqueued)]
pub struct PageEnqueueError {
    pub stats: EnqueueStats,
    #[source]
    pub source: EnqueueError,
}

pub type EnqueueResult<T> = Result<T, PageEnqueueError>;

/// Per-page counters. Observability only, nothing branches on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueStats {
    pub enqueued: u64,
    pub skipped_tagged: u64,
    pub skipped_wrong_extension: u64,
}

impl AddAssign for EnqueueStats {
    fn add_assign(&mut self, other: Self) {
        self.enqueued += other.enqueued;
        self.skipped_tagged += other.skipped_tagged;
        self.skipped_wrong_extension += other.skipped_wrong_extension;
    }
}

/// Publishes one conversion job per unconverted recording of a page.
pub struct Enqueuer {
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn JobPublisher>,
    settings: EnqueueSection,
    url_encoded_keys: bool,
    policy: BackoffPolicy,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn JobPublisher>,
        settings: EnqueueSection,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            url_encoded_keys: false,
            policy: BackoffPolicy::default(),
        }
    }

    /// Backoff applied to each tag read and publish call.
    pub fn with_retry(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Treat listed keys as form-encoded (`+` for space, `%XX` escapes).
    pub fn with_url_encoded_keys(mut self, enabled: bool) -> Self {
        self.url_encoded_keys = enabled;
        self
    }

    /// Walks `objects` in listing order. Transient errors are retried on the
    /// failing call only, so every key is published at most once per page.
    /// The first error left after retries stops the page; jobs already
    /// published stay published and are counted in the error's stats.
    pub async fn enqueue_page(&self, objects: &[ObjectSummary]) -> EnqueueResult<EnqueueStats> {
        let mut stats = EnqueueStats::default();
        for object in objects {
            if let Err(source) = self.enqueue_object(object, &mut stats).await {
                return Err(PageEnqueueError { stats, source });
            }
        }
        info!(
            enqueued = stats.enqueued,
            skipped_tagged = stats.skipped_tagged,
            skipped_wrong_extension = stats.skipped_wrong_extension,
            "enqueued page"
        );
        Ok(stats)
    }

    async fn enqueue_object(
        &self,
        object: &ObjectSummary,
        stats: &mut EnqueueStats,
    ) -> Result<(), EnqueueError> {
        let owned_key = if self.url_encoded_keys {
            decode_key(&object.key)
        } else {
            object.key.clone()
        };
        let key = owned_key.as_str();
        if !key.ends_with(&self.settings.source_extension) {
            debug!(%key, "skipping non-recording key");
            stats.skipped_wrong_extension += 1;
            return Ok(());
        }

        let tags = self
            .policy
            .retry("get_tags", EnqueueError::classify, || async move {
                self.store
                    .get_tags(key)
                    .await
                    .map_err(|source| EnqueueError::Tags {
                        key: key.to_string(),
                        source,
                    })
            })
            .await?;
        if tags.contains_key(&self.settings.tag_key) && !self.settings.overwrite_previous_converted
        {
            debug!(%key, "skipping converted recording");
            stats.skipped_tagged += 1;
            return Ok(());
        }

        let job = &ConversionJob::new(key);
        let delay = Duration::from_secs(self.settings.delay_seconds);
        let message_id = self
            .policy
            .retry("publish", EnqueueError::classify, || async move {
                self.publisher
                    .publish(job, delay)
                    .await
                    .map_err(|source| EnqueueError::Publish {
                        key: key.to_string(),
                        source,
                    })
            })
            .await?;
        debug!(%key, %message_id, "enqueued conversion job");
        stats.enqueued += 1;
        Ok(())
    }
}

/// Decodes a form-encoded object key (`+` for space, `%XX` escapes).
/// Malformed escapes are kept literally.
pub fn decode_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

//! Conversion of a single recording plus the receive/acknowledge loop that
//! feeds it from the queue.
//!
//! The idempotency tag is always the last write: a recording carries it only
//! after its content was replaced and its storage tier transitioned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CallrecConfig;
use crate::queue::{ConversionJob, Delivery, FailureRecord, JobSource, QueueError, QueueResult};
use crate::storage::{ObjectStore, StorageError, StorageTier};
use crate::transcode::{ensure_target, TranscodeError, Transcoder};

const FIRST_PASS_FILE: &str = "first-pass.wav";
const OUTPUT_FILE: &str = "converted.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    Decode,
    InspectTags,
    Resolve,
    Scratch,
    Transcode,
    Verify,
    Upload,
    Transition,
    Tag,
}

impl ConversionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionStage::Decode => "decode",
            ConversionStage::InspectTags => "inspect_tags",
            ConversionStage::Resolve => "resolve",
            ConversionStage::Scratch => "scratch",
            ConversionStage::Transcode => "transcode",
            ConversionStage::Verify => "verify",
            ConversionStage::Upload => "upload",
            ConversionStage::Transition => "transition",
            ConversionStage::Tag => "tag",
        }
    }
}

impl fmt::Display for ConversionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{stage} failed: {source}")]
    Storage {
        stage: ConversionStage,
        source: StorageError,
    },
    #[error("{stage} failed: {source}")]
    Transcode {
        stage: ConversionStage,
        source: TranscodeError,
    },
    #[error("scratch file error at {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Job(#[from] QueueError),
}

impl WorkerError {
    pub fn stage(&self) -> ConversionStage {
        match self {
            WorkerError::Storage { stage, .. } | WorkerError::Transcode { stage, .. } => *stage,
            WorkerError::Scratch { .. } => ConversionStage::Scratch,
            WorkerError::Job(_) => ConversionStage::Decode,
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted {
        key: String,
        sha256: String,
        bytes: u64,
    },
    AlreadyConverted {
        key: String,
    },
}

/// Settings the worker needs out of the full configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub tag_key: String,
    pub tag_value: String,
    pub overwrite_previous_converted: bool,
    pub storage_tier: StorageTier,
    pub signed_url_ttl: Duration,
    pub scratch_dir: Option<PathBuf>,
    pub verify_output: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &CallrecConfig) -> Self {
        Self {
            tag_key: config.enqueue.tag_key.clone(),
            tag_value: config.enqueue.tag_value.clone(),
            overwrite_previous_converted: config.enqueue.overwrite_previous_converted,
            storage_tier: config.convert.storage_tier,
            signed_url_ttl: config.convert.signed_url_ttl(),
            scratch_dir: config.convert.scratch_dir.clone(),
            verify_output: config.convert.verify_output,
        }
    }
}

pub struct ConversionWorker {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    settings: WorkerSettings,
}

impl ConversionWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn Transcoder>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            transcoder,
            settings,
        }
    }

    pub async fn handle(&self, job: &ConversionJob) -> WorkerResult<ConversionOutcome> {
        let key = job.key.as_str();
        let mut tags = self
            .store
            .get_tags(key)
            .await
            .map_err(storage_error(ConversionStage::InspectTags))?;
        if tags.contains_key(&self.settings.tag_key) && !self.settings.overwrite_previous_converted
        {
            info!(key, "recording already converted, skipping");
            return Ok(ConversionOutcome::AlreadyConverted {
                key: key.to_string(),
            });
        }

        let url = self
            .store
            .presign_get(key, self.settings.signed_url_ttl)
            .await
            .map_err(storage_error(ConversionStage::Resolve))?;
        debug!(key, url = %redact_url(&url), "resolved signed url");

        // Removed on drop, whichever way this function returns.
        let scratch = self.scratch_dir()?;
        let first_pass = scratch.path().join(FIRST_PASS_FILE);
        let output = scratch.path().join(OUTPUT_FILE);

        self.transcoder
            .transcode(&url, &first_pass)
            .await
            .map_err(transcode_error(ConversionStage::Transcode))?;
        // Second pass rewrites the header; some sources leave it inconsistent.
        self.transcoder
            .transcode(&first_pass.to_string_lossy(), &output)
            .await
            .map_err(transcode_error(ConversionStage::Transcode))?;

        if self.settings.verify_output {
            let format = self
                .transcoder
                .probe(&output)
                .await
                .and_then(ensure_target)
                .map_err(transcode_error(ConversionStage::Verify))?;
            debug!(key, %format, "verified output format");
        }

        let (sha256, bytes) = digest_file(&output).await?;

        self.store
            .put_object_from_path(key, &output)
            .await
            .map_err(storage_error(ConversionStage::Upload))?;
        self.store
            .copy_with_storage_class(key, self.settings.storage_tier)
            .await
            .map_err(storage_error(ConversionStage::Transition))?;

        tags.insert(self.settings.tag_key.clone(), self.settings.tag_value.clone());
        self.store
            .put_tags(key, &tags)
            .await
            .map_err(storage_error(ConversionStage::Tag))?;

        info!(key, bytes, %sha256, tier = %self.settings.storage_tier, "converted recording");
        Ok(ConversionOutcome::Converted {
            key: key.to_string(),
            sha256,
            bytes,
        })
    }

    fn scratch_dir(&self) -> WorkerResult<TempDir> {
        let result = match &self.settings.scratch_dir {
            Some(parent) => tempfile::Builder::new()
                .prefix("callrec-")
                .tempdir_in(parent),
            None => tempfile::Builder::new().prefix("callrec-").tempdir(),
        };
        result.map_err(|source| WorkerError::Scratch {
            path: self
                .settings
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            source,
        })
    }
}

fn storage_error(stage: ConversionStage) -> impl FnOnce(StorageError) -> WorkerError {
    move |source| WorkerError::Storage { stage, source }
}

fn transcode_error(stage: ConversionStage) -> impl FnOnce(TranscodeError) -> WorkerError {
    move |source| WorkerError::Transcode { stage, source }
}

async fn digest_file(path: &Path) -> WorkerResult<(String, u64)> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|source| WorkerError::Scratch {
            path: path.to_path_buf(),
            source,
        })?;
    let digest = Sha256::digest(&contents);
    Ok((hex::encode(digest), contents.len() as u64))
}

/// Passes fatal queue errors through; anything else is logged and returned
/// as text for the job report.
fn tolerate(
    delivery: &Delivery,
    action: &str,
    result: QueueResult<()>,
) -> QueueResult<Option<String>> {
    match result {
        Ok(()) => Ok(None),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(
                message_id = %delivery.message_id,
                action,
                error = %err,
                "queue call failed, message left for redelivery"
            );
            Ok(Some(err.to_string()))
        }
    }
}

/// Drops the query string and fragment so signatures never reach the logs.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Done { outcome: ConversionOutcome },
    Failed { stage: ConversionStage, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub message_id: String,
    pub key: Option<String>,
    pub receive_count: u32,
    pub status: JobStatus,
    /// Acknowledge or failure-record error the runner stepped over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub converted: u64,
    pub already_converted: u64,
    pub failed: u64,
}

impl WorkerSummary {
    fn record(&mut self, report: &JobReport) {
        self.processed += 1;
        match &report.status {
            JobStatus::Done {
                outcome: ConversionOutcome::Converted { .. },
            } => self.converted += 1,
            JobStatus::Done {
                outcome: ConversionOutcome::AlreadyConverted { .. },
            } => self.already_converted += 1,
            JobStatus::Failed { .. } => self.failed += 1,
        }
    }
}

/// Claims jobs one at a time. Success acknowledges the message; failure is
/// recorded and the message left to reappear after its visibility timeout.
pub struct WorkerRunner {
    source: Arc<dyn JobSource>,
    worker: ConversionWorker,
    idle_poll: Duration,
}

impl WorkerRunner {
    pub fn new(source: Arc<dyn JobSource>, worker: ConversionWorker, idle_poll: Duration) -> Self {
        Self {
            source,
            worker,
            idle_poll,
        }
    }

    /// Claims and handles one job. Only a fatal queue error is returned once
    /// a job was claimed: a stale receipt (the job outlived its visibility
    /// timeout and was claimed again) or a busy database is logged and kept
    /// in the report.
    pub async fn run_once(&self) -> QueueResult<Option<JobReport>> {
        let Some(delivery) = self.source.receive().await? else {
            return Ok(None);
        };
        let result = match ConversionJob::from_body(&delivery.body) {
            Ok(job) => (Some(job.key.clone()), self.worker.handle(&job).await),
            Err(err) => (None, Err(WorkerError::from(err))),
        };
        let report = match result {
            (key, Ok(outcome)) => {
                let queue_error = tolerate(
                    &delivery,
                    "acknowledge",
                    self.source.acknowledge(&delivery).await,
                )?;
                JobReport {
                    message_id: delivery.message_id.clone(),
                    key,
                    receive_count: delivery.receive_count,
                    status: JobStatus::Done { outcome },
                    queue_error,
                }
            }
            (key, Err(err)) => self.fail(&delivery, key, err).await?,
        };
        Ok(Some(report))
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        key: Option<String>,
        err: WorkerError,
    ) -> QueueResult<JobReport> {
        let stage = err.stage();
        warn!(
            message_id = %delivery.message_id,
            key = key.as_deref().unwrap_or_default(),
            receive_count = delivery.receive_count,
            %stage,
            error = %err,
            "conversion failed"
        );
        let recorded = self
            .source
            .report_failure(&FailureRecord {
                message_id: delivery.message_id.clone(),
                object_key: key.clone(),
                stage: stage.as_str().to_string(),
                error: err.to_string(),
                receive_count: delivery.receive_count,
                failed_at: Utc::now(),
            })
            .await;
        let queue_error = tolerate(delivery, "report_failure", recorded)?;
        Ok(JobReport {
            message_id: delivery.message_id.clone(),
            key,
            receive_count: delivery.receive_count,
            status: JobStatus::Failed {
                stage,
                error: err.to_string(),
            },
            queue_error,
        })
    }

    /// Processes jobs until `max_jobs` have been handled, or until the queue
    /// is empty when `stop_when_idle` is set. Otherwise polls forever.
    pub async fn run(
        &self,
        max_jobs: Option<u64>,
        stop_when_idle: bool,
    ) -> QueueResult<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        loop {
            if max_jobs.is_some_and(|limit| summary.processed >= limit) {
                break;
            }
            match self.run_once().await {
                Ok(Some(report)) => summary.record(&report),
                Ok(None) if stop_when_idle => break,
                Ok(None) => tokio::time::sleep(self.idle_poll).await,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "queue busy, backing off");
                    tokio::time::sleep(self.idle_poll).await;
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            processed = summary.processed,
            converted = summary.converted,
            already_converted = summary.already_converted,
            failed = summary.failed,
            "worker stopped"
        );
        Ok(summary)
    }
}

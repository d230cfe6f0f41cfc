//! Page-by-page run over one date prefix: list, enqueue, wait for the queue
//! to drain, then move on to the next page.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CallrecConfig;
use crate::drain::QueueDrainMonitor;
use crate::enqueue::{EnqueueError, EnqueueStats, Enqueuer};
use crate::error::ConfigError;
use crate::listing::{ListingPage, PageCursor, PaginatedLister};
use crate::prefix::{build_prefix, DateSelection};
use crate::queue::{DepthProbe, JobPublisher, QueueError};
use crate::retry::{BackoffPolicy, ErrorClass};
use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listing {prefix} failed: {source}")]
    Listing {
        prefix: String,
        source: StorageError,
    },
    #[error("enqueue aborted the run: {0}")]
    Enqueue(EnqueueError),
    #[error("queue depth unavailable: {0}")]
    Drain(QueueError),
    #[error("run exceeded {limit:?}")]
    Timeout { limit: Duration },
    #[error("failed to append run history to {path}: {source}")]
    History {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialise run report: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Where a run stands. Every step returns a new value instead of mutating
/// shared counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub selection: DateSelection,
    pub date: NaiveDate,
    pub prefix: String,
    pub cursor: PageCursor,
    pub pages_listed: u32,
    pub stats: EnqueueStats,
    pub drain_waits: u32,
}

impl RunState {
    pub fn configure(
        selection: DateSelection,
        today: NaiveDate,
        prefix_root: &str,
    ) -> Result<Self, ConfigError> {
        let date = selection.resolve(today)?;
        Ok(Self {
            selection,
            date,
            prefix: build_prefix(prefix_root, date),
            cursor: PageCursor::Start,
            pages_listed: 0,
            stats: EnqueueStats::default(),
            drain_waits: 0,
        })
    }

    fn listed(self, next: PageCursor) -> Self {
        Self {
            cursor: next,
            pages_listed: self.pages_listed + 1,
            ..self
        }
    }

    fn enqueued(self, stats: EnqueueStats) -> Self {
        let mut total = self.stats;
        total += stats;
        Self {
            stats: total,
            ..self
        }
    }

    fn drained(self, waits: u32) -> Self {
        Self {
            drain_waits: self.drain_waits + waits,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A listed page came back empty.
    NothingToDo,
    /// The last page was enqueued and the queue drained.
    Drained,
}

/// An enqueue failure the run recorded and stepped over.
#[derive(Debug, Clone, Serialize)]
pub struct CaughtError {
    pub page: u32,
    pub class: ErrorClass,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub selection: DateSelection,
    pub date: NaiveDate,
    pub prefix: String,
    pub pages_listed: u32,
    pub stats: EnqueueStats,
    pub drain_waits: u32,
    pub caught_errors: Vec<CaughtError>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    enqueuer: Enqueuer,
    monitor: QueueDrainMonitor,
    policy: BackoffPolicy,
    prefix_root: String,
    max_keys: i32,
    run_timeout: Duration,
    history_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        config: &CallrecConfig,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn JobPublisher>,
        probe: Arc<dyn DepthProbe>,
    ) -> Self {
        let policy = BackoffPolicy::from_section(&config.orchestrator);
        let enqueuer = Enqueuer::new(Arc::clone(&store), publisher, config.enqueue.clone())
            .with_url_encoded_keys(config.listing.url_encoded_keys)
            .with_retry(policy);
        let monitor = QueueDrainMonitor::new(
            probe,
            config.orchestrator.drain_poll_interval(),
            config.orchestrator.drain_criterion,
        );
        Self {
            store,
            enqueuer,
            monitor,
            policy,
            prefix_root: config.store.prefix_root.clone(),
            max_keys: config.listing.max_keys,
            run_timeout: config.orchestrator.run_timeout(),
            history_path: config.orchestrator.history_path.clone(),
        }
    }

    pub fn with_history_path(mut self, path: Option<PathBuf>) -> Self {
        self.history_path = path;
        self
    }

    /// Runs the whole prefix under the hard run timeout and appends the
    /// report to the history file when one is configured.
    pub async fn run(
        &self,
        selection: DateSelection,
        today: NaiveDate,
    ) -> OrchestratorResult<RunReport> {
        let state = RunState::configure(selection, today, &self.prefix_root)?;
        info!(prefix = %state.prefix, date = %state.date, "starting run");
        let report = match tokio::time::timeout(self.run_timeout, self.execute(state)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(limit_secs = self.run_timeout.as_secs(), "run timed out");
                return Err(OrchestratorError::Timeout {
                    limit: self.run_timeout,
                });
            }
        };
        self.append_history(&report).await?;
        info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            pages = report.pages_listed,
            enqueued = report.stats.enqueued,
            skipped_tagged = report.stats.skipped_tagged,
            caught = report.caught_errors.len(),
            "run finished"
        );
        Ok(report)
    }

    async fn execute(&self, mut state: RunState) -> OrchestratorResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let lister = PaginatedLister::new(Arc::clone(&self.store), &state.prefix, self.max_keys);
        let mut caught_errors = Vec::new();

        let outcome = loop {
            let page = self.list_page(&lister, &state.cursor).await?;
            let more = page.has_more();
            state = state.listed(page.next.clone());
            if page.is_empty() {
                break RunOutcome::NothingToDo;
            }

            match self.enqueuer.enqueue_page(&page.objects).await {
                Ok(stats) => state = state.enqueued(stats),
                Err(stopped) => {
                    state = state.enqueued(stopped.stats);
                    let err = stopped.source;
                    match err.classify() {
                        ErrorClass::Fatal => return Err(OrchestratorError::Enqueue(err)),
                        class => {
                            warn!(
                                page = state.pages_listed,
                                ?class,
                                error = %err,
                                "enqueue failed, continuing"
                            );
                            caught_errors.push(CaughtError {
                                page: state.pages_listed,
                                class,
                                error: err.to_string(),
                            });
                        }
                    }
                }
            }

            let waits = self.wait_for_drain().await?;
            state = state.drained(waits);

            if !more {
                break RunOutcome::Drained;
            }
        };

        Ok(RunReport {
            run_id,
            selection: state.selection,
            date: state.date,
            prefix: state.prefix,
            pages_listed: state.pages_listed,
            stats: state.stats,
            drain_waits: state.drain_waits,
            caught_errors,
            outcome,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn list_page(
        &self,
        lister: &PaginatedLister,
        cursor: &PageCursor,
    ) -> OrchestratorResult<ListingPage> {
        self.policy
            .retry("list_page", classify_storage, || lister.list_page(cursor))
            .await
            .map_err(|source| OrchestratorError::Listing {
                prefix: lister.prefix().to_string(),
                source,
            })
    }

    async fn wait_for_drain(&self) -> OrchestratorResult<u32> {
        self.policy
            .retry("wait_for_drain", classify_queue, || self.monitor.wait_for_drain())
            .await
            .map(|report| report.waits)
            .map_err(OrchestratorError::Drain)
    }

    async fn append_history(&self, report: &RunReport) -> OrchestratorResult<()> {
        let Some(path) = &self.history_path else {
            return Ok(());
        };
        let history_error = |source| OrchestratorError::History {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(history_error)?;
        }
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(history_error)?;
        file.write_all(&line).await.map_err(history_error)?;
        file.flush().await.map_err(history_error)?;
        Ok(())
    }
}

fn classify_storage(err: &StorageError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

fn classify_queue(err: &QueueError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_resolves_prefix_once() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 22).unwrap();
        let state =
            RunState::configure(DateSelection::DaysAgo(7), today, "recordings/").unwrap();
        assert_eq!(state.prefix, "recordings/2024/01/15/");
        assert_eq!(state.cursor, PageCursor::Start);
        assert_eq!(state.pages_listed, 0);
    }

    #[test]
    fn steps_return_new_state() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 22).unwrap();
        let state = RunState::configure(DateSelection::DaysAgo(0), today, "r").unwrap();
        let next = state
            .clone()
            .listed(PageCursor::Continue("t".into()))
            .enqueued(EnqueueStats {
                enqueued: 2,
                skipped_tagged: 1,
                skipped_wrong_extension: 0,
            })
            .drained(3);
        assert_eq!(state.pages_listed, 0);
        assert_eq!(next.pages_listed, 1);
        assert_eq!(next.cursor, PageCursor::Continue("t".into()));
        assert_eq!(next.stats.enqueued, 2);
        assert_eq!(next.drain_waits, 3);
    }
}

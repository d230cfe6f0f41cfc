pub mod config;
pub mod drain;
pub mod enqueue;
pub mod error;
pub mod listing;
pub mod orchestrator;
pub mod prefix;
pub mod queue;
pub mod retry;
pub mod schedule;
mod sqlite;
pub mod storage;
pub mod transcode;
pub mod worker;

pub use config::{
    load_config, parse_config, CallrecConfig, ConvertSection, EnqueueSection, ListingSection,
    OrchestratorSection, QueueSection, ScheduleSection, StoreSection,
};
pub use drain::{DrainCriterion, DrainReport, QueueDrainMonitor};
pub use enqueue::{EnqueueError, EnqueueResult, EnqueueStats, Enqueuer, PageEnqueueError};
pub use error::{ConfigError, Result};
pub use listing::{ListingPage, PageCursor, PaginatedLister};
pub use orchestrator::{
    CaughtError, Orchestrator, OrchestratorError, OrchestratorResult, RunOutcome, RunReport,
    RunState,
};
pub use prefix::{build_prefix, DateSelection};
pub use queue::{
    ConversionJob, DeadLetter, Delivery, DepthProbe, FailureRecord, JobPublisher, JobSource,
    QueueDepth, QueueError, QueueResult, RecordingPublisher, SqliteConversionQueue,
    SqliteConversionQueueBuilder,
};
pub use retry::{BackoffPolicy, ErrorClass};
pub use storage::{
    MemoryObjectStore, ObjectStore, ObjectSummary, S3ObjectStore, StorageError, StorageResult,
    StorageTier, TagSet,
};
pub use transcode::{
    CommandExecutor, FfmpegTranscoder, StreamFormat, SystemCommandExecutor, TranscodeError,
    Transcoder,
};
pub use worker::{
    ConversionOutcome, ConversionStage, ConversionWorker, JobReport, JobStatus, WorkerError,
    WorkerRunner, WorkerSettings, WorkerSummary,
};

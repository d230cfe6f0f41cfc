use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callrec_core::storage::{OperationKind, StoreOperation};
use callrec_core::{
    parse_config, CallrecConfig, ConversionJob, DateSelection, DepthProbe, EnqueueStats,
    Enqueuer, JobPublisher, MemoryObjectStore, Orchestrator, OrchestratorError, PageCursor,
    PaginatedLister, QueueDepth, QueueError, QueueResult, RecordingPublisher, RunOutcome,
    SqliteConversionQueue, StorageError, TagSet,
};
use chrono::NaiveDate;
use tempfile::TempDir;

const PREFIX: &str = "recordings/2024/01/15/";

fn config(extra: &str) -> CallrecConfig {
    parse_config(&format!(
        "[store]\nbucket = \"recordings-bucket\"\nprefix_root = \"recordings/\"\n{extra}"
    ))
    .expect("valid config")
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 22).unwrap()
}

fn converted() -> TagSet {
    TagSet::from([("convert-batch".to_string(), "true".to_string())])
}

fn keys(jobs: &[ConversionJob]) -> Vec<&str> {
    jobs.iter().map(|job| job.key.as_str()).collect()
}

/// Returns scripted depths, repeating the last one forever.
struct ScriptedDepth(Mutex<VecDeque<QueueDepth>>);

impl ScriptedDepth {
    fn delayed(values: &[u64]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            values
                .iter()
                .map(|&delayed| QueueDepth {
                    delayed,
                    ..QueueDepth::default()
                })
                .collect(),
        )))
    }
}

#[async_trait]
impl DepthProbe for ScriptedDepth {
    async fn approximate_depth(&self) -> QueueResult<QueueDepth> {
        let mut depths = self.0.lock().unwrap();
        if depths.len() > 1 {
            Ok(depths.pop_front().unwrap())
        } else {
            Ok(depths.front().copied().unwrap_or_default())
        }
    }
}

struct BrokenQueue;

#[async_trait]
impl JobPublisher for BrokenQueue {
    async fn publish(&self, _job: &ConversionJob, _delay: Duration) -> QueueResult<String> {
        Err(QueueError::MissingStore)
    }
}

#[tokio::test]
async fn pages_enumerate_every_object_once_in_order() {
    let store = MemoryObjectStore::new("bucket");
    let expected: Vec<String> = (0..7).map(|i| format!("{PREFIX}call-{i}.wav")).collect();
    for key in &expected {
        store.insert(key.clone(), b"audio".to_vec());
    }
    store.insert("recordings/2024/01/16/other.wav", b"audio".to_vec());

    let lister = PaginatedLister::new(Arc::new(store), PREFIX, 3);
    let mut cursor = PageCursor::Start;
    let mut seen = Vec::new();
    let mut pages = 0;
    while !cursor.is_exhausted() {
        let page = lister.list_page(&cursor).await.unwrap();
        assert!(page.objects.len() <= 3);
        seen.extend(page.objects.into_iter().map(|object| object.key));
        cursor = page.next;
        pages += 1;
    }
    assert_eq!(pages, 3);
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn tagged_recording_is_skipped() {
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"a".to_vec());
    store.insert_with_tags(format!("{PREFIX}b.wav"), b"b".to_vec(), converted());
    store.insert(format!("{PREFIX}c.wav"), b"c".to_vec());
    let store = Arc::new(store);
    let publisher = RecordingPublisher::new();

    let page = PaginatedLister::new(store.clone(), PREFIX, 1000)
        .list_page(&PageCursor::Start)
        .await
        .unwrap();
    let stats = Enqueuer::new(
        store,
        Arc::new(publisher.clone()),
        config("").enqueue,
    )
    .enqueue_page(&page.objects)
    .await
    .unwrap();

    assert_eq!(
        stats,
        EnqueueStats {
            enqueued: 2,
            skipped_tagged: 1,
            skipped_wrong_extension: 0
        }
    );
    assert_eq!(
        keys(&publisher.published()),
        [
            "recordings/2024/01/15/a.wav",
            "recordings/2024/01/15/c.wav"
        ]
    );
}

#[tokio::test]
async fn non_recordings_are_never_enqueued() {
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}notes.txt"), b"n".to_vec());
    store.insert(format!("{PREFIX}a.WAV.bak"), b"n".to_vec());
    store.insert_with_tags(format!("{PREFIX}meta.json"), b"n".to_vec(), converted());
    let store = Arc::new(store);
    let publisher = RecordingPublisher::new();

    let section = config("[enqueue]\noverwrite_previous_converted = true\n").enqueue;
    let page = PaginatedLister::new(store.clone(), PREFIX, 1000)
        .list_page(&PageCursor::Start)
        .await
        .unwrap();
    let stats = Enqueuer::new(store.clone(), Arc::new(publisher.clone()), section)
        .enqueue_page(&page.objects)
        .await
        .unwrap();

    assert_eq!(stats.skipped_wrong_extension, 3);
    assert!(publisher.published().is_empty());
    assert!(store
        .operations()
        .iter()
        .all(|operation| matches!(operation, StoreOperation::List { .. })));
}

#[tokio::test]
async fn overwrite_requeues_converted_recordings() {
    let store = MemoryObjectStore::new("bucket");
    store.insert_with_tags(format!("{PREFIX}a.wav"), b"a".to_vec(), converted());
    let store = Arc::new(store);
    let publisher = RecordingPublisher::new();
    let section = config("[enqueue]\noverwrite_previous_converted = true\n").enqueue;

    let page = PaginatedLister::new(store.clone(), PREFIX, 1000)
        .list_page(&PageCursor::Start)
        .await
        .unwrap();
    let stats = Enqueuer::new(store, Arc::new(publisher.clone()), section)
        .enqueue_page(&page.objects)
        .await
        .unwrap();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.skipped_tagged, 0);
}

#[tokio::test]
async fn url_encoded_keys_are_decoded_before_use() {
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}agent+7%3A1.wav"), b"a".to_vec());
    store.insert(format!("{PREFIX}agent 7:1.wav"), b"a".to_vec());
    let store = Arc::new(store);
    let publisher = RecordingPublisher::new();

    let objects = vec![PaginatedLister::new(store.clone(), PREFIX, 1000)
        .list_page(&PageCursor::Start)
        .await
        .unwrap()
        .objects
        .remove(1)];
    assert_eq!(objects[0].key, format!("{PREFIX}agent+7%3A1.wav"));
    Enqueuer::new(store, Arc::new(publisher.clone()), config("").enqueue)
        .with_url_encoded_keys(true)
        .enqueue_page(&objects)
        .await
        .unwrap();
    assert_eq!(
        keys(&publisher.published()),
        ["recordings/2024/01/15/agent 7:1.wav"]
    );
}

#[tokio::test]
async fn run_walks_all_pages_into_the_queue() {
    let dir = TempDir::new().unwrap();
    let config = config(&format!(
        "[listing]\nmax_keys = 2\nnum_days_age = 7\n[queue]\npath = {:?}\n",
        dir.path().join("queue.sqlite")
    ));
    let queue = SqliteConversionQueue::builder()
        .path(&config.queue.path)
        .build()
        .unwrap();
    queue.initialize().unwrap();

    let store = MemoryObjectStore::new("bucket");
    for name in ["a", "b", "c", "d"] {
        store.insert(format!("{PREFIX}{name}.wav"), b"x".to_vec());
    }
    store.insert_with_tags(format!("{PREFIX}e.wav"), b"x".to_vec(), converted());
    let queue = Arc::new(queue);
    let orchestrator = Orchestrator::new(&config, Arc::new(store), queue.clone(), queue.clone());

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    assert_eq!(report.prefix, PREFIX);
    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.pages_listed, 3);
    assert_eq!(report.stats.enqueued, 4);
    assert_eq!(report.stats.skipped_tagged, 1);
    assert!(report.caught_errors.is_empty());
    assert_eq!(queue.depth().unwrap().visible, 4);
}

#[tokio::test]
async fn empty_prefix_is_nothing_to_do() {
    let config = config("");
    let publisher = Arc::new(RecordingPublisher::new());
    let store = MemoryObjectStore::new("bucket");
    store.insert("recordings/2024/01/14/a.wav", b"x".to_vec());
    let orchestrator = Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher);

    let date = DateSelection::from_override(Some("01/15/2024"), 7).unwrap();
    let report = orchestrator.run(date, today()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::NothingToDo);
    assert_eq!(report.pages_listed, 1);
    assert_eq!(report.stats, EnqueueStats::default());
}

#[tokio::test(start_paused = true)]
async fn run_waits_for_the_queue_before_the_next_page() {
    let config = config("[listing]\nmax_keys = 1\n");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    store.insert(format!("{PREFIX}b.wav"), b"x".to_vec());
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(store),
        publisher.clone(),
        ScriptedDepth::delayed(&[3, 1, 0]),
    );

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    assert_eq!(report.pages_listed, 2);
    assert_eq!(report.drain_waits, 2);
    assert_eq!(publisher.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    store.inject_failure(
        OperationKind::List,
        None,
        StorageError::ConnectionError("reset".into()),
        2,
    );
    store.inject_failure(
        OperationKind::GetTags,
        None,
        StorageError::Throttled("SlowDown".into()),
        1,
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator =
        Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher.clone());

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.stats.enqueued, 1);
    assert_eq!(publisher.published().len(), 1);
}

#[tokio::test]
async fn ignorable_enqueue_errors_are_recorded() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    store.inject_failure(
        OperationKind::GetTags,
        None,
        StorageError::AccessDenied {
            bucket: "bucket".into(),
        },
        1,
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher);

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.caught_errors.len(), 1);
    assert_eq!(report.caught_errors[0].page, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_resumes_at_the_failing_key() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    for name in ["a", "b", "c"] {
        store.insert(format!("{PREFIX}{name}.wav"), b"x".to_vec());
    }
    let failing = format!("{PREFIX}c.wav");
    store.inject_failure(
        OperationKind::GetTags,
        Some(failing.as_str()),
        StorageError::Throttled("SlowDown".into()),
        1,
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator =
        Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher.clone());

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    let published = publisher.published();
    assert_eq!(
        keys(&published),
        vec![
            format!("{PREFIX}a.wav"),
            format!("{PREFIX}b.wav"),
            format!("{PREFIX}c.wav")
        ]
    );
    assert_eq!(report.stats.enqueued, 3);
    assert!(report.caught_errors.is_empty());
}

#[tokio::test]
async fn stopped_page_still_counts_published_jobs() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    for name in ["a", "b", "c"] {
        store.insert(format!("{PREFIX}{name}.wav"), b"x".to_vec());
    }
    let failing = format!("{PREFIX}c.wav");
    store.inject_failure(
        OperationKind::GetTags,
        Some(failing.as_str()),
        StorageError::AccessDenied {
            bucket: "bucket".into(),
        },
        1,
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator =
        Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher.clone());

    let report = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    assert_eq!(publisher.published().len(), 2);
    assert_eq!(report.stats.enqueued, 2);
    assert_eq!(report.caught_errors.len(), 1);
}

#[tokio::test]
async fn unusable_queue_aborts_the_run() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(store),
        Arc::new(BrokenQueue),
        Arc::new(RecordingPublisher::new()),
    );

    let err = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Enqueue(_)));
}

#[tokio::test]
async fn listing_errors_fail_the_run() {
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    store.inject_failure(
        OperationKind::List,
        None,
        StorageError::AccessDenied {
            bucket: "bucket".into(),
        },
        1,
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher);

    let err = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Listing { .. }));
}

#[tokio::test(start_paused = true)]
async fn run_hits_the_hard_timeout_when_the_queue_never_drains() {
    let config = config("[orchestrator]\nrun_timeout_hours = 1\n");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(store),
        Arc::new(RecordingPublisher::new()),
        ScriptedDepth::delayed(&[1]),
    );

    let err = orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout { .. }));
}

#[tokio::test]
async fn reports_are_appended_to_history() {
    let dir = TempDir::new().unwrap();
    let history = dir.path().join("history").join("runs.jsonl");
    let config = config("");
    let store = MemoryObjectStore::new("bucket");
    store.insert(format!("{PREFIX}a.wav"), b"x".to_vec());
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::new(&config, Arc::new(store), publisher.clone(), publisher)
        .with_history_path(Some(history.clone()));

    orchestrator
        .run(DateSelection::DaysAgo(7), today())
        .await
        .unwrap();
    orchestrator
        .run(DateSelection::DaysAgo(6), today())
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&history).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["outcome"], "drained");
    assert_eq!(lines[0]["prefix"], PREFIX);
    assert_eq!(lines[1]["outcome"], "nothing_to_do");
}

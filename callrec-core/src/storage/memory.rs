//! In-process object store used by tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ObjectPage, ObjectStore, ObjectSummary, StorageError, StorageResult, StorageTier, TagSet,
};

const TOKEN_PREFIX: &str = "after:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub tags: TagSet,
    pub storage_tier: StorageTier,
    pub last_modified: DateTime<Utc>,
}

/// Mutating and reading calls, in the order the store received them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    List { prefix: String, token: Option<String> },
    GetTags { key: String },
    PutTags { key: String },
    Presign { key: String },
    Upload { key: String },
    Transition { key: String, tier: StorageTier },
}

impl StoreOperation {
    fn kind(&self) -> OperationKind {
        match self {
            StoreOperation::List { .. } => OperationKind::List,
            StoreOperation::GetTags { .. } => OperationKind::GetTags,
            StoreOperation::PutTags { .. } => OperationKind::PutTags,
            StoreOperation::Presign { .. } => OperationKind::Presign,
            StoreOperation::Upload { .. } => OperationKind::Upload,
            StoreOperation::Transition { .. } => OperationKind::Transition,
        }
    }

    fn key(&self) -> Option<&str> {
        match self {
            StoreOperation::List { .. } => None,
            StoreOperation::GetTags { key }
            | StoreOperation::PutTags { key }
            | StoreOperation::Presign { key }
            | StoreOperation::Upload { key }
            | StoreOperation::Transition { key, .. } => Some(key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    List,
    GetTags,
    PutTags,
    Presign,
    Upload,
    Transition,
}

#[derive(Debug)]
struct InjectedFault {
    kind: OperationKind,
    key: Option<String>,
    error: StorageError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    operations: Vec<StoreOperation>,
    faults: VecDeque<InjectedFault>,
}

#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.insert_with_tags(key, body, TagSet::new());
    }

    pub fn insert_with_tags(&self, key: impl Into<String>, body: impl Into<Vec<u8>>, tags: TagSet) {
        self.lock().objects.insert(
            key.into(),
            StoredObject {
                body: body.into(),
                tags,
                storage_tier: StorageTier::Standard,
                last_modified: Utc::now(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        self.lock().operations.clone()
    }

    /// Makes the next `times` calls of `kind` (optionally only for `key`) fail with `error`.
    pub fn inject_failure(
        &self,
        kind: OperationKind,
        key: Option<&str>,
        error: StorageError,
        times: usize,
    ) {
        self.lock().faults.push_back(InjectedFault {
            kind,
            key: key.map(str::to_string),
            error,
            remaining: times,
        });
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked; the map is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, operation: StoreOperation) -> StorageResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        let kind = operation.kind();
        let key = operation.key().map(str::to_string);
        state.operations.push(operation);
        let position = state.faults.iter().position(|fault| {
            fault.kind == kind
                && fault.remaining > 0
                && (fault.key.is_none() || fault.key == key)
        });
        if let Some(index) = position {
            let fault = &mut state.faults[index];
            fault.remaining -= 1;
            let error = fault.error.clone();
            if fault.remaining == 0 {
                state.faults.remove(index);
            }
            return Err(error);
        }
        Ok(state)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<&str>,
    ) -> StorageResult<ObjectPage> {
        let state = self.record(StoreOperation::List {
            prefix: prefix.to_string(),
            token: continuation_token.map(str::to_string),
        })?;
        let lower = match continuation_token {
            Some(token) => {
                let after = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
                    StorageError::S3Error(format!("invalid continuation token {token}"))
                })?;
                Bound::Excluded(after.to_string())
            }
            None => Bound::Included(prefix.to_string()),
        };
        let limit = usize::try_from(max_keys.max(0)).unwrap_or_default();
        let mut matching = state
            .objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));
        let objects: Vec<ObjectSummary> = matching
            .by_ref()
            .take(limit)
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                last_modified: Some(object.last_modified),
                size: object.body.len() as i64,
            })
            .collect();
        let more = matching.next().is_some();
        let next_token = match objects.last() {
            Some(last) if more => Some(format!("{TOKEN_PREFIX}{}", last.key)),
            _ => None,
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get_tags(&self, key: &str) -> StorageResult<TagSet> {
        let state = self.record(StoreOperation::GetTags {
            key: key.to_string(),
        })?;
        state
            .objects
            .get(key)
            .map(|object| object.tags.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put_tags(&self, key: &str, tags: &TagSet) -> StorageResult<()> {
        let mut state = self.record(StoreOperation::PutTags {
            key: key.to_string(),
        })?;
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        object.tags = tags.clone();
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let state = self.record(StoreOperation::Presign {
            key: key.to_string(),
        })?;
        if !state.objects.contains_key(key) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            self.bucket,
            key,
            expires_in.as_secs()
        ))
    }

    async fn put_object_from_path(&self, key: &str, path: &Path) -> StorageResult<()> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|err| StorageError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        let mut state = self.record(StoreOperation::Upload {
            key: key.to_string(),
        })?;
        let now = Utc::now();
        // A plain put starts a fresh object version: no tags, standard tier.
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                tags: TagSet::new(),
                storage_tier: StorageTier::Standard,
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn copy_with_storage_class(&self, key: &str, tier: StorageTier) -> StorageResult<()> {
        let mut state = self.record(StoreOperation::Transition {
            key: key.to_string(),
            tier,
        })?;
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        object.storage_tier = tier;
        object.last_modified = Utc::now();
        Ok(())
    }
}

mod error;
pub mod memory;
pub mod s3;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryObjectStore, OperationKind, StoreOperation, StoredObject};
pub use s3::S3ObjectStore;

/// Object tags, ordered by key.
pub type TagSet = BTreeMap<String, String>;

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: i64,
}

/// Raw page returned by the store, `next_token` is set iff more pages remain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

/// The subset of an object store the pipeline needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<&str>,
    ) -> StorageResult<ObjectPage>;

    async fn get_tags(&self, key: &str) -> StorageResult<TagSet>;

    /// Replaces the whole tag set of `key`.
    async fn put_tags(&self, key: &str, tags: &TagSet) -> StorageResult<()>;

    /// Issues a time-limited read URL for `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Overwrites `key` with the content of a local file.
    async fn put_object_from_path(&self, key: &str, path: &Path) -> StorageResult<()>;

    /// Copies `key` onto itself with a new storage class, keeping metadata.
    async fn copy_with_storage_class(&self, key: &str, tier: StorageTier) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageTier {
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    GlacierIr,
    DeepArchive,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Standard => "STANDARD",
            StorageTier::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageTier::StandardIa => "STANDARD_IA",
            StorageTier::OnezoneIa => "ONEZONE_IA",
            StorageTier::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageTier::Glacier => "GLACIER",
            StorageTier::GlacierIr => "GLACIER_IR",
            StorageTier::DeepArchive => "DEEP_ARCHIVE",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(Self::Standard),
            "REDUCED_REDUNDANCY" => Ok(Self::ReducedRedundancy),
            "STANDARD_IA" => Ok(Self::StandardIa),
            "ONEZONE_IA" => Ok(Self::OnezoneIa),
            "INTELLIGENT_TIERING" => Ok(Self::IntelligentTiering),
            "GLACIER" => Ok(Self::Glacier),
            "GLACIER_IR" => Ok(Self::GlacierIr),
            "DEEP_ARCHIVE" => Ok(Self::DeepArchive),
            other => Err(StorageError::ConfigurationError(format!(
                "unknown storage tier {other}"
            ))),
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::drain::DrainCriterion;
use crate::error::{ConfigError, Result};
use crate::storage::StorageTier;

pub const DEFAULT_MAX_KEYS: i32 = 1000;
pub const DEFAULT_TAG_KEY: &str = "convert-batch";
pub const DEFAULT_TAG_VALUE: &str = "true";
pub const DEFAULT_SOURCE_EXTENSION: &str = ".wav";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CallrecConfig {
    pub store: StoreSection,
    #[serde(default)]
    pub listing: ListingSection,
    #[serde(default)]
    pub enqueue: EnqueueSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub convert: ConvertSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
}

impl CallrecConfig {
    /// Applies `CALLREC_*` overrides on top of the file values.
    ///
    /// `lookup` is usually `std::env::var(..).ok()`; tests pass a map.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CALLREC_BUCKET") {
            self.store.bucket = value;
        }
        if let Some(value) = lookup("CALLREC_PREFIX") {
            self.store.prefix_root = value;
        }
        if let Some(value) = lookup("CALLREC_KMS_KEY_ID") {
            self.store.kms_key_id = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = lookup("CALLREC_MAX_KEYS") {
            self.listing.max_keys = value.trim().parse().map_err(|_| ConfigError::Env {
                name: "CALLREC_MAX_KEYS",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("CALLREC_NUM_DAYS_AGE") {
            self.listing.num_days_age = value.trim().parse().map_err(|_| ConfigError::Env {
                name: "CALLREC_NUM_DAYS_AGE",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("CALLREC_OVERWRITE_PREVIOUS_CONVERTED") {
            self.enqueue.overwrite_previous_converted =
                parse_flag(&value).ok_or(ConfigError::Env {
                    name: "CALLREC_OVERWRITE_PREVIOUS_CONVERTED",
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("CALLREC_STORAGE_TIER") {
            self.convert.storage_tier = value.parse().map_err(|_| ConfigError::Env {
                name: "CALLREC_STORAGE_TIER",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("CALLREC_QUEUE_PATH") {
            self.queue.path = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.trim().is_empty() {
            return Err(invalid("store.bucket", "must not be empty"));
        }
        if !(1..=DEFAULT_MAX_KEYS).contains(&self.listing.max_keys) {
            return Err(invalid(
                "listing.max_keys",
                format!("{} is outside 1..=1000", self.listing.max_keys),
            ));
        }
        if self.queue.max_receive_count == 0 {
            return Err(invalid("queue.max_receive_count", "must be at least 1"));
        }
        if self.enqueue.source_extension.is_empty() {
            return Err(invalid("enqueue.source_extension", "must not be empty"));
        }
        if self.enqueue.tag_key.is_empty() {
            return Err(invalid("enqueue.tag_key", "must not be empty"));
        }
        if !(self.orchestrator.retry_backoff_rate >= 1.0) {
            return Err(invalid(
                "orchestrator.retry_backoff_rate",
                format!("{} is below 1.0", self.orchestrator.retry_backoff_rate),
            ));
        }
        if self.orchestrator.run_timeout_hours == 0 {
            return Err(invalid("orchestrator.run_timeout_hours", "must be positive"));
        }
        if self.schedule.hour_utc > 23 {
            return Err(invalid(
                "schedule.hour_utc",
                format!("{} is not an hour of the day", self.schedule.hour_utc),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub bucket: String,
    /// Key root in front of `YYYY/MM/DD/`, e.g. `connect/instance/CallRecordings/`.
    #[serde(default)]
    pub prefix_root: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingSection {
    pub max_keys: i32,
    pub num_days_age: u32,
    /// Decode `+`/`%XX` in listed keys, for stores configured with url encoding.
    pub url_encoded_keys: bool,
}

impl Default for ListingSection {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            num_days_age: 7,
            url_encoded_keys: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnqueueSection {
    pub overwrite_previous_converted: bool,
    pub source_extension: String,
    pub tag_key: String,
    pub tag_value: String,
    pub delay_seconds: u64,
}

impl Default for EnqueueSection {
    fn default() -> Self {
        Self {
            overwrite_previous_converted: false,
            source_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
            tag_key: DEFAULT_TAG_KEY.to_string(),
            tag_value: DEFAULT_TAG_VALUE.to_string(),
            delay_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub path: PathBuf,
    pub visibility_timeout_seconds: u64,
    pub max_receive_count: u32,
    pub idle_poll_seconds: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/conversion_queue.sqlite"),
            visibility_timeout_seconds: 90 * 60,
            max_receive_count: 5,
            idle_poll_seconds: 20,
        }
    }
}

impl QueueSection {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvertSection {
    pub storage_tier: StorageTier,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub signed_url_ttl_seconds: u64,
    pub transcode_timeout_seconds: u64,
    pub verify_output: bool,
}

impl Default for ConvertSection {
    fn default() -> Self {
        Self {
            storage_tier: StorageTier::Glacier,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            scratch_dir: None,
            signed_url_ttl_seconds: 60,
            transcode_timeout_seconds: 600,
            verify_output: false,
        }
    }
}

impl ConvertSection {
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub drain_poll_seconds: u64,
    pub drain_criterion: DrainCriterion,
    pub retry_base_seconds: u64,
    pub retry_backoff_rate: f64,
    pub retry_max_attempts: u32,
    pub run_timeout_hours: u64,
    pub history_path: Option<PathBuf>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            drain_poll_seconds: 60,
            drain_criterion: DrainCriterion::DelayedOnly,
            retry_base_seconds: 5,
            retry_backoff_rate: 1.05,
            retry_max_attempts: 3,
            run_timeout_hours: 30,
            history_path: None,
        }
    }
}

impl OrchestratorSection {
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.drain_poll_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub hour_utc: u32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self { hour_utc: 23 }
    }
}

/// Loads the file, applies environment overrides and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CallrecConfig> {
    let mut config: CallrecConfig = load_toml(path)?;
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<CallrecConfig> {
    let config: CallrecConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        source,
        path: PathBuf::from("<inline>"),
    })?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/callrec.toml");
        let config: CallrecConfig = load_toml(&path).expect("fixture should parse");
        config.validate().expect("fixture should validate");
        assert_eq!(config.store.bucket, "connect-recordings");
        assert_eq!(config.listing.max_keys, 1000);
        assert_eq!(config.queue.max_receive_count, 5);
        assert_eq!(config.convert.storage_tier, StorageTier::Glacier);
        assert_eq!(config.orchestrator.drain_criterion, DrainCriterion::DelayedOnly);
    }

    #[test]
    fn minimal_config_uses_reference_defaults() {
        let config = parse_config("[store]\nbucket = \"b\"\n").unwrap();
        assert_eq!(config.listing.max_keys, 1000);
        assert_eq!(config.enqueue.tag_key, "convert-batch");
        assert_eq!(config.enqueue.source_extension, ".wav");
        assert!(!config.enqueue.overwrite_previous_converted);
        assert_eq!(config.queue.visibility_timeout(), Duration::from_secs(5400));
        assert_eq!(config.orchestrator.drain_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.orchestrator.run_timeout(), Duration::from_secs(30 * 3600));
        assert_eq!(config.schedule.hour_utc, 23);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = parse_config("[store]\nbucket = \"b\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("CALLREC_BUCKET", "other"),
            ("CALLREC_MAX_KEYS", "250"),
            ("CALLREC_OVERWRITE_PREVIOUS_CONVERTED", "True"),
            ("CALLREC_STORAGE_TIER", "STANDARD_IA"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.bucket, "other");
        assert_eq!(config.listing.max_keys, 250);
        assert!(config.enqueue.overwrite_previous_converted);
        assert_eq!(config.convert.storage_tier, StorageTier::StandardIa);
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut config = parse_config("[store]\nbucket = \"b\"\n").unwrap();
        let err = config
            .apply_overrides(|name| (name == "CALLREC_MAX_KEYS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "CALLREC_MAX_KEYS", .. }));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let err = parse_config("[store]\nbucket = \"b\"\n[listing]\nmax_keys = 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "listing.max_keys", .. }));

        let err = parse_config("[store]\nbucket = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "store.bucket", .. }));

        let err = parse_config("[store]\nbucket = \"b\"\n[convert]\nstorage_tier = \"COLD\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

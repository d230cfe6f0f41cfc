use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Region},
    error::SdkError,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{MetadataDirective, ServerSideEncryption, StorageClass, Tag, Tagging},
    Client,
};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;

use super::{
    ObjectPage, ObjectStore, ObjectSummary, StorageError, StorageResult, StorageTier, TagSet,
};
use crate::config::StoreSection;

/// Unreserved characters plus `/` pass through; everything else in a copy
/// source is percent-encoded.
const COPY_SOURCE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// S3 (or S3-compatible) bucket behind the [`ObjectStore`] seam.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    kms_key_id: Option<String>,
}

impl S3ObjectStore {
    /// Builds the client from the ambient AWS configuration chain.
    ///
    /// A configured endpoint switches to path-style addressing, which
    /// MinIO and LocalStack require.
    pub async fn connect(section: &StoreSection) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &section.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &section.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::from_client(
            Client::from_conf(builder.build()),
            section.bucket.clone(),
            section.kms_key_id.clone(),
        )
    }

    pub fn from_client(client: Client, bucket: String, kms_key_id: Option<String>) -> Self {
        Self {
            client,
            bucket,
            kms_key_id,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<&str>,
    ) -> StorageResult<ObjectPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys);
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, prefix))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?.to_string();
                let last_modified = object
                    .last_modified()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()));
                Some(ObjectSummary {
                    key,
                    last_modified,
                    size: object.size().unwrap_or_default(),
                })
            })
            .collect();
        let next_token = response
            .next_continuation_token()
            .filter(|token| !token.is_empty())
            .map(ToString::to_string);
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get_tags(&self, key: &str) -> StorageResult<TagSet> {
        let response = self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, key))?;
        Ok(response
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    async fn put_tags(&self, key: &str, tags: &TagSet) -> StorageResult<()> {
        let tag_set = tags
            .iter()
            .map(|(name, value)| Tag::builder().key(name).value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StorageError::ConfigurationError(err.to_string()))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|err| StorageError::ConfigurationError(err.to_string()))?;
        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, key))?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| StorageError::ConfigurationError(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, key))?;
        Ok(request.uri().to_string())
    }

    async fn put_object_from_path(&self, key: &str, path: &Path) -> StorageResult<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| StorageError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body);
        if let Some(kms_key_id) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }
        request
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, key))?;
        debug!(bucket = %self.bucket, key, "uploaded object");
        Ok(())
    }

    async fn copy_with_storage_class(&self, key: &str, tier: StorageTier) -> StorageResult<()> {
        let source = copy_source(&self.bucket, key);
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(key)
            .storage_class(StorageClass::from(tier.as_str()))
            .metadata_directive(MetadataDirective::Copy);
        if let Some(kms_key_id) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }
        request
            .send()
            .await
            .map_err(|err| map_sdk_error(&err, &self.bucket, key))?;
        debug!(bucket = %self.bucket, key, %tier, "transitioned storage class");
        Ok(())
    }
}

/// `bucket/key` with the key url-encoded, as the CopySource header expects.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_SET))
}

/// Maps any S3 operation error onto [`StorageError`], keeping the transient
/// cases (throttling, 5xx, dispatch I/O and timeouts) distinguishable.
fn map_sdk_error<E>(err: &SdkError<E>, bucket: &str, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(service_err) => match service_err.raw().status().as_u16() {
            404 => {
                return StorageError::NotFound {
                    key: key.to_string(),
                }
            }
            403 => {
                return StorageError::AccessDenied {
                    bucket: bucket.to_string(),
                }
            }
            429 | 500 | 502 | 503 | 504 => return StorageError::Throttled(err.to_string()),
            _ => {}
        },
        SdkError::DispatchFailure(dispatch_err) => {
            if dispatch_err.is_io() || dispatch_err.is_timeout() {
                return StorageError::ConnectionError(err.to_string());
            }
        }
        SdkError::TimeoutError(_) => return StorageError::ConnectionError(err.to_string()),
        _ => {}
    }
    StorageError::S3Error(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_encodes_the_key_but_keeps_slashes() {
        assert_eq!(
            copy_source("bucket", "recordings/2024/01/15/agent+7.wav"),
            "bucket/recordings/2024/01/15/agent%2B7.wav"
        );
        assert_eq!(
            copy_source("bucket", "a/agent 7:1 café.wav"),
            "bucket/a/agent%207%3A1%20caf%C3%A9.wav"
        );
        assert_eq!(copy_source("bucket", "plain-key_1.wav"), "bucket/plain-key_1.wav");
    }
}

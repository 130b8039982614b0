use crate::config::S3Config;
use crate::device::{Device, PendingPublish};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Bound on a single object write unless overridden.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Object store write failure. Device bookkeeping is left untouched when
/// a publish returns one.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to put object {key}: {message}")]
    Put { key: String, message: String },

    #[error("Put of object {key} did not finish within {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

/// A single snapshot write.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotObject {
    pub key: String,
    pub body: Bytes,
    pub content_type: &'static str,
    /// Downstream caches must not serve the object past this instant
    pub expires: DateTime<Utc>,
    pub cache_control: String,
}

/// Put-object seam over the backing store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, object: SnapshotObject) -> Result<(), StoreError>;
}

/// S3-backed object store. One client is shared by every worker.
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout())
                    .build(),
            )
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, object: SnapshotObject) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object.key)
            .body(ByteStream::from(object.body))
            .content_type(object.content_type)
            .cache_control(object.cache_control)
            .expires(S3DateTime::from_secs(object.expires.timestamp()))
            .send()
            .await
            .map_err(|e| StoreError::Put {
                key: object.key.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// What a publish call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Image,
    Fallback,
    /// Fallback already live; nothing written.
    Skipped,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Image => "image",
            PublishOutcome::Fallback => "fallback",
            PublishOutcome::Skipped => "skipped",
        }
    }
}

/// Writes the current snapshot (or the fallback) for a device.
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    key_prefix: Option<String>,
    cache_ttl: Duration,
    write_timeout: Duration,
}

impl Publisher {
    /// `cache_ttl` should equal the polling interval so cached copies expire
    /// when the next refresh is due.
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: Option<String>, cache_ttl: Duration) -> Self {
        let key_prefix = key_prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Self {
            store,
            key_prefix,
            cache_ttl,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Give up on a store write after `timeout`. The write then fails with
    /// [`StoreError::Timeout`].
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Object key: `{prefix}/{id}.jpg`, or `{id}.jpg` without a prefix.
    pub fn object_key(&self, device_id: &str) -> String {
        let name = format!("{}.jpg", sanitize_path_component(device_id));
        match &self.key_prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name,
        }
    }

    #[instrument(skip(self, device), fields(device_id = %device.id()))]
    pub async fn publish(&self, device: &mut Device) -> Result<PublishOutcome, StoreError> {
        let (body, outcome) = match device.pending_publish() {
            PendingPublish::Skip => {
                debug!("Fallback already published, skipping upload");
                return Ok(PublishOutcome::Skipped);
            }
            PendingPublish::Image(body) => (body, PublishOutcome::Image),
            PendingPublish::Fallback(body) => (body, PublishOutcome::Fallback),
        };

        let object = SnapshotObject {
            key: self.object_key(device.id()),
            body,
            content_type: JPEG_CONTENT_TYPE,
            expires: Utc::now() + chrono::Duration::seconds(self.cache_ttl.as_secs() as i64),
            cache_control: format!("max-age={}", self.cache_ttl.as_secs()),
        };

        debug!(
            key = %object.key,
            size_bytes = object.body.len(),
            payload = outcome.as_str(),
            "Uploading snapshot"
        );

        let key = object.key.clone();
        tokio::time::timeout(self.write_timeout, self.store.put_object(object))
            .await
            .map_err(|_| StoreError::Timeout {
                key,
                timeout: self.write_timeout,
            })??;

        device.mark_published(outcome == PublishOutcome::Fallback);

        Ok(outcome)
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

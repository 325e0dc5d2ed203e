//! src/services/object_store.rs
//!
//! Remote object store access. The pipeline talks to the `ObjectStore` trait
//! only; `S3ObjectStore` is the S3-compatible implementation used at runtime.

use crate::{config::AppConfig, models::object::ObjectDescriptor};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, timeout::TimeoutConfig};
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::Object,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::DateTime;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use std::{io, path::Path};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing `{prefix}` in bucket `{bucket}` failed: {message}")]
    List {
        bucket: String,
        prefix: String,
        message: String,
    },
    #[error("listing returned an entry without a key")]
    MissingKey,
    #[error("bucket `{bucket}` is not reachable: {message}")]
    Bucket { bucket: String, message: String },
    #[error("get `{key}` failed: {message}")]
    Get { key: String, message: String },
    #[error("put `{key}` failed: {message}")]
    Put { key: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the conversion pipeline needs from a remote store.
///
/// Implementations are shared by every worker and must tolerate concurrent calls.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Endpoint identifier recorded alongside ledger rows.
    fn endpoint(&self) -> &str;

    /// Recursively enumerate objects under `prefix`.
    ///
    /// Errors are yielded in-line; the stream keeps going after one.
    fn list(&self, bucket: &str, prefix: &str)
    -> BoxStream<'static, StoreResult<ObjectDescriptor>>;

    /// Stream an object to `dest`, overwriting it. Returns the bytes written.
    async fn fetch_to_local(&self, bucket: &str, key: &str, dest: &Path) -> StoreResult<u64>;

    /// Upload `body` to `key`, replacing whatever is stored there.
    async fn put(&self, bucket: &str, key: &str, body: Bytes, content_type: &str)
    -> StoreResult<()>;
}

/// S3-compatible store client (AWS, MinIO and friends) using path-style addressing.
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
}

impl S3ObjectStore {
    /// Build a client with static credentials against the configured endpoint.
    ///
    /// Every request is bounded by the configured operation timeout.
    pub async fn connect(cfg: &AppConfig) -> Self {
        let credentials = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "webp-converter-static",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .endpoint_url(&cfg.endpoint)
            .credentials_provider(credentials)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(cfg.request_timeout)
                    .build(),
            )
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            endpoint: cfg.endpoint.clone(),
        }
    }

    /// Confirm the bucket exists and the credentials can reach it.
    pub async fn check_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|err| StoreError::Bucket {
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn list(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> BoxStream<'static, StoreResult<ObjectDescriptor>> {
        let pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        stream::unfold(pages, |mut pages| async move {
            let page = pages.next().await?;
            Some((page, pages))
        })
        .flat_map(move |page| {
            let entries: Vec<StoreResult<ObjectDescriptor>> = match page {
                Ok(output) => output.contents().iter().map(descriptor_from).collect(),
                Err(err) => vec![Err(StoreError::List {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                    message: DisplayErrorContext(&err).to_string(),
                })],
            };
            stream::iter(entries)
        })
        .boxed()
    }

    async fn fetch_to_local(&self, bucket: &str, key: &str, dest: &Path) -> StoreResult<u64> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::Get {
                key: key.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(dest).await?;

        let mut body = output.body;
        let mut written: u64 = 0;
        while let Some(chunk) = body.try_next().await.map_err(|err| StoreError::Get {
            key: key.to_string(),
            message: err.to_string(),
        })? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("fetched {} ({} bytes) to {}", key, written, dest.display());
        Ok(written)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StoreResult<()> {
        let content_md5 = general_purpose::STANDARD.encode(md5::compute(&body).0);
        let content_length = body.len() as i64;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_length(content_length)
            .content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StoreError::Put {
                key: key.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        Ok(())
    }
}

/// Map one listing entry into a descriptor. Keyless entries are listing errors.
fn descriptor_from(object: &Object) -> StoreResult<ObjectDescriptor> {
    let key = object.key().ok_or(StoreError::MissingKey)?;
    Ok(ObjectDescriptor {
        key: key.to_string(),
        size: object.size().unwrap_or_default(),
        last_modified: object
            .last_modified()
            .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())),
        etag: object.e_tag().map(|tag| tag.trim_matches('"').to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::primitives::DateTime as SmithyDateTime;

    #[test]
    fn descriptor_carries_key_size_and_metadata() {
        let object = Object::builder()
            .key("wp-content/a.jpg")
            .size(500)
            .e_tag("\"abc123\"")
            .last_modified(SmithyDateTime::from_secs(1_700_000_000))
            .build();

        let descriptor = descriptor_from(&object).expect("descriptor");
        assert_eq!(descriptor.key, "wp-content/a.jpg");
        assert_eq!(descriptor.size, 500);
        assert_eq!(descriptor.etag.as_deref(), Some("abc123"));
        assert_eq!(
            descriptor.last_modified.map(|ts| ts.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn keyless_entry_is_a_listing_error() {
        let object = Object::builder().size(10).build();
        assert!(matches!(descriptor_from(&object), Err(StoreError::MissingKey)));
    }
}

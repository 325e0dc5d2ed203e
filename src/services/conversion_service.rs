//! src/services/conversion_service.rs
//!
//! ConversionService: the batch pipeline. A single producer walks the bucket
//! listing; every image that the ledger has not seen is handed to a worker
//! task that downloads, re-encodes as WebP, uploads over the original key and
//! records the conversion. At most `concurrency` workers exist at once.

use crate::{
    config::AppConfig,
    errors::{ConvertError, Stage},
    models::{
        conversion::ConversionRecord,
        object::{ObjectDescriptor, key_extension},
    },
    services::{
        image_codec::{ImageCodec, WebpSettings},
        ledger_service::LedgerService,
        object_store::ObjectStore,
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs,
    sync::Semaphore,
    task::{self, JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const WEBP_CONTENT_TYPE: &str = "image/webp";

/// Knobs the pipeline needs from the application config.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub bucket: String,
    pub folder: String,
    pub staging_dir: PathBuf,
    pub concurrency: usize,
    pub webp: WebpSettings,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            bucket: cfg.bucket.clone(),
            folder: cfg.folder.clone(),
            staging_dir: cfg.staging_dir.clone(),
            concurrency: cfg.concurrency,
            webp: cfg.webp,
        }
    }
}

/// Terminal state of an image that did not fail.
#[derive(Debug)]
pub enum ItemOutcome {
    AlreadyConverted,
    Converted(ConversionRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub key: String,
    pub stage: Stage,
}

/// Tally of one pass over the bucket.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub listed: u64,
    pub listing_errors: u64,
    pub skipped_not_image: u64,
    pub skipped_converted: u64,
    pub converted: u64,
    pub cancelled: u64,
    pub untracked_uploads: u64,
    pub bytes_before: i64,
    pub bytes_after: i64,
    pub failures: Vec<ItemFailure>,
}

impl RunSummary {
    fn absorb(&mut self, joined: Result<(String, Result<ItemOutcome, ConvertError>), JoinError>) {
        match joined {
            Ok((_, Ok(ItemOutcome::AlreadyConverted))) => self.skipped_converted += 1,
            Ok((_, Ok(ItemOutcome::Converted(record)))) => {
                self.converted += 1;
                self.bytes_before += record.size;
                self.bytes_after += record.size_after;
            }
            Ok((_, Err(ConvertError::Cancelled))) => self.cancelled += 1,
            Ok((key, Err(err))) => {
                if err.is_untracked_upload() {
                    self.untracked_uploads += 1;
                }
                self.failures.push(ItemFailure {
                    key,
                    stage: err.stage(),
                });
            }
            Err(err) => {
                error!("conversion worker aborted: {}", err);
                self.failures.push(ItemFailure {
                    key: String::new(),
                    stage: Stage::Worker,
                });
            }
        }
    }
}

/// Orchestrates listing, dedup and the bounded pool of conversion workers.
///
/// Cloning is cheap; each worker task owns a clone.
#[derive(Clone)]
pub struct ConversionService {
    store: Arc<dyn ObjectStore>,
    ledger: LedgerService,
    codec: ImageCodec,
    settings: Arc<PipelineSettings>,
}

impl ConversionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ledger: LedgerService,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            codec: ImageCodec::new(settings.webp),
            settings: Arc::new(settings),
        }
    }

    /// Process every object under the configured folder, then wait for all
    /// workers to finish.
    ///
    /// Per-item failures are logged and counted, never returned. Cancelling
    /// `cancel` stops the listing and interrupts in-flight work.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let settings = &self.settings;
        let semaphore = Arc::new(Semaphore::new(settings.concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = RunSummary::default();

        info!(
            "Scanning bucket `{}` under `{}` with {} workers",
            settings.bucket, settings.folder, settings.concurrency
        );
        let mut listing = self.store.list(&settings.bucket, &settings.folder);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Cancellation requested; no further objects will be listed");
                    break;
                }
                next = listing.next() => next,
            };
            let Some(entry) = next else { break };

            let object = match entry {
                Ok(object) => object,
                Err(err) => {
                    summary.listing_errors += 1;
                    error!(stage = "listing", "Error listing objects: {}", err);
                    continue;
                }
            };
            summary.listed += 1;

            if !object.is_convertible_image() {
                summary.skipped_not_image += 1;
                debug!("Skipping non-image object {}", object.key);
                continue;
            }

            // Backpressure: stop pulling from the listing until a worker frees up.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                summary.absorb(joined);
            }

            let worker = self.clone();
            let cancel = cancel.clone();
            let span = info_span!("object", key = %object.key);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let key = object.key.clone();
                    let outcome = worker.process(object, cancel).await;
                    (key, outcome)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            summary.absorb(joined);
        }

        summary
    }

    /// Run one image through the pipeline and log how it ended.
    async fn process(
        &self,
        object: ObjectDescriptor,
        cancel: CancellationToken,
    ) -> Result<ItemOutcome, ConvertError> {
        let result = self.convert(&object, &cancel).await;

        match &result {
            Ok(ItemOutcome::AlreadyConverted) => {
                info!("File '{}' has already been converted. Skipping.", object.key)
            }
            Ok(ItemOutcome::Converted(record)) => info!(
                "Successfully converted and uploaded {} to WebP format ({} -> {} bytes)",
                object.key, record.size, record.size_after
            ),
            Err(ConvertError::Cancelled) => {
                warn!("Processing of '{}' cancelled", object.key)
            }
            Err(err) if err.is_untracked_upload() => error!(
                stage = %err.stage(),
                "Object '{}' was overwritten with WebP but is not tracked: {}",
                object.key,
                err
            ),
            Err(err) => error!(
                stage = %err.stage(),
                "Error processing object '{}': {}",
                object.key,
                err
            ),
        }

        result
    }

    async fn convert(
        &self,
        object: &ObjectDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome, ConvertError> {
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        if self
            .ledger
            .has_been_converted(object)
            .await
            .map_err(ConvertError::Lookup)?
        {
            return Ok(ItemOutcome::AlreadyConverted);
        }

        let staged = self.staging_path(&object.key);
        let uploaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConvertError::Cancelled),
            result = self.transcode_and_upload(object, &staged) => result,
        };
        self.remove_staged(&staged).await;
        let size_after = uploaded?;

        // The WebP bytes are live from here on; record them even if cancelled.
        let record = self
            .ledger
            .record(object, size_after, Utc::now())
            .await
            .map_err(ConvertError::Record)?;

        Ok(ItemOutcome::Converted(record))
    }

    /// Download → decode → encode → upload. Returns the uploaded byte count.
    async fn transcode_and_upload(
        &self,
        object: &ObjectDescriptor,
        staged: &Path,
    ) -> Result<i64, ConvertError> {
        let fetched = self
            .store
            .fetch_to_local(&self.settings.bucket, &object.key, staged)
            .await
            .map_err(ConvertError::Download)?;
        info!("Downloaded object from S3: {} ({} bytes)", object.key, fetched);

        let original = fs::read(staged).await.map_err(ConvertError::Staging)?;

        let codec = self.codec;
        let webp = task::spawn_blocking(move || {
            let image = codec.decode(&original).map_err(ConvertError::Decode)?;
            codec.encode_webp(&image).map_err(ConvertError::Encode)
        })
        .await
        .map_err(|err| ConvertError::Worker(err.to_string()))??;

        let size_after = webp.len() as i64;
        self.store
            .put(
                &self.settings.bucket,
                &object.key,
                Bytes::from(webp),
                WEBP_CONTENT_TYPE,
            )
            .await
            .map_err(ConvertError::Upload)?;

        Ok(size_after)
    }

    /// Staging location for a key: `staging_dir/{shard}/{shard}/{md5(key)}.{ext}`.
    ///
    /// The raw key never becomes part of the path, so keys containing `..`
    /// cannot escape the staging directory.
    fn staging_path(&self, key: &str) -> PathBuf {
        let digest = md5::compute(key.as_bytes());
        let mut path = self.settings.staging_dir.clone();
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));

        let stem = format!("{:x}", digest);
        match key_extension(key).filter(|ext| !ext.is_empty()) {
            Some(ext) => path.push(format!("{}.{}", stem, ext)),
            None => path.push(stem),
        }
        path
    }

    async fn remove_staged(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(_) => debug!("Removed staged file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove staged file {}: {}", path.display(), err),
        }
    }
}

//! Per-item conversion errors.
//!
//! Every failure after the dedup check is wrapped in a `ConvertError` so the
//! worker boundary can log the stage it happened in and move on.

use crate::services::{image_codec::CodecError, object_store::StoreError};
use std::{fmt, io};
use thiserror::Error;

/// Pipeline stage an item was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DedupCheck,
    Download,
    Decode,
    Encode,
    Upload,
    Record,
    Worker,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DedupCheck => "dedup-check",
            Stage::Download => "download",
            Stage::Decode => "decode",
            Stage::Encode => "encode",
            Stage::Upload => "upload",
            Stage::Record => "record",
            Stage::Worker => "worker",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to query conversion ledger: {0}")]
    Lookup(#[source] sqlx::Error),
    #[error("failed to download object: {0}")]
    Download(#[source] StoreError),
    #[error("failed to read staged file: {0}")]
    Staging(#[source] io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[source] CodecError),
    #[error("failed to convert image to WebP: {0}")]
    Encode(#[source] CodecError),
    #[error("failed to upload WebP image: {0}")]
    Upload(#[source] StoreError),
    #[error("uploaded but failed to record conversion: {0}")]
    Record(#[source] sqlx::Error),
    #[error("conversion task failed: {0}")]
    Worker(String),
    #[error("cancelled before completion")]
    Cancelled,
}

impl ConvertError {
    pub fn stage(&self) -> Stage {
        match self {
            ConvertError::Lookup(_) => Stage::DedupCheck,
            ConvertError::Download(_) | ConvertError::Staging(_) => Stage::Download,
            ConvertError::Decode(_) => Stage::Decode,
            ConvertError::Encode(_) => Stage::Encode,
            ConvertError::Upload(_) => Stage::Upload,
            ConvertError::Record(_) => Stage::Record,
            ConvertError::Worker(_) | ConvertError::Cancelled => Stage::Worker,
        }
    }

    /// True when the object was overwritten remotely but no ledger row exists.
    pub fn is_untracked_upload(&self) -> bool {
        matches!(self, ConvertError::Record(_))
    }
}

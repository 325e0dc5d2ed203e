//! Represents an object (file) as reported by the remote store listing.

use chrono::{DateTime, Utc};

/// Extensions (lowercase, without the dot) eligible for WebP conversion.
pub const CONVERTIBLE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Identity of a single remote object produced by the listing.
///
/// Descriptors are never mutated once listed; the pipeline only reads them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes at listing time.
    pub size: i64,

    /// Timestamp when the object was last modified, if the store reports it.
    pub last_modified: Option<DateTime<Utc>>,

    /// Store-supplied entity tag, if any.
    pub etag: Option<String>,
}

impl ObjectDescriptor {
    pub fn new(key: impl Into<String>, size: i64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
        }
    }

    /// Lowercased extension of the key, if it has one.
    pub fn extension(&self) -> Option<String> {
        key_extension(&self.key)
    }

    /// True when the key carries one of the convertible image extensions.
    pub fn is_convertible_image(&self) -> bool {
        self.extension()
            .is_some_and(|ext| CONVERTIBLE_EXTENSIONS.contains(&ext.as_str()))
    }
}

/// Text after the last `.` of the key's final `/` segment, lowercased.
///
/// Keys ending in `/` are folder markers and have no extension. A leading
/// dot counts, so `.jpg` has the extension `jpg`.
pub fn key_extension(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

//! Represents a row of the conversion ledger.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Provenance of one successful WebP conversion, as stored in `converted_files`.
///
/// Rows are inserted once and never updated or deleted by this tool.
#[derive(Clone, FromRow, Debug)]
pub struct ConversionRecord {
    /// Internal row id.
    pub id: i64,

    /// Original object key.
    pub filename: String,

    /// Logical path used together with `filename` for dedup matching.
    pub filepath: String,

    /// Size in bytes before conversion.
    pub size: i64,

    /// When the converted object was recorded.
    pub converted_time: DateTime<Utc>,

    /// Store endpoint the object lives on.
    pub endpoint: Option<String>,

    /// Bucket the object lives in.
    pub bucket: Option<String>,

    /// Size in bytes of the uploaded WebP payload.
    pub size_after: i64,
}

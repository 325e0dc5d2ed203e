//! src/services/ledger_service.rs
//!
//! LedgerService: SQLite-backed record of which objects have already been
//! converted. Lookups decide whether an object is skipped; inserts are the
//! only durability point of a conversion.

use crate::models::{conversion::ConversionRecord, object::ObjectDescriptor};
use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, migrate::MigrateError};
use std::sync::Arc;

/// Where converted objects live; stamped onto and matched against every row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerContext {
    pub endpoint: String,
    pub bucket: String,
    pub folder: String,
}

impl LedgerContext {
    /// Logical path stored in `filepath`: the scanned folder joined with the key.
    ///
    /// Empty parts are dropped and the result is lexically cleaned, so rows
    /// written by earlier tools with the same join still match.
    pub fn filepath(&self, key: &str) -> String {
        let joined = [self.folder.as_str(), key]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        if joined.is_empty() {
            return joined;
        }
        clean_path(&joined)
    }
}

/// Collapse repeated slashes, `.` segments and `..` segments without touching
/// the filesystem. `..` never climbs above a leading `/`.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if rooted => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let body = segments.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{}", body),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

/// Concurrent-safe handle over the `converted_files` table.
#[derive(Clone)]
pub struct LedgerService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,

    context: LedgerContext,
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(db).await
}

impl LedgerService {
    pub fn new(db: Arc<SqlitePool>, context: LedgerContext) -> Self {
        Self { db, context }
    }

    /// Verify the ledger table is reachable. Returns the number of stored rows.
    pub async fn ping(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM converted_files")
            .fetch_one(&*self.db)
            .await
    }

    /// True if a row for this object exists whose size before *or* after
    /// conversion equals the object's current size.
    ///
    /// Matching `size_after` keeps an already-converted WebP object from being
    /// converted again. Unrelated files of identical size also match.
    pub async fn has_been_converted(&self, object: &ObjectDescriptor) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM converted_files
             WHERE filename = ? AND endpoint = ? AND bucket = ?
               AND (size = ? OR size_after = ?) AND filepath = ?",
        )
        .bind(&object.key)
        .bind(&self.context.endpoint)
        .bind(&self.context.bucket)
        .bind(object.size)
        .bind(object.size)
        .bind(self.context.filepath(&object.key))
        .fetch_one(&*self.db)
        .await?;

        Ok(count > 0)
    }

    /// Insert the provenance row for a completed conversion.
    pub async fn record(
        &self,
        object: &ObjectDescriptor,
        size_after: i64,
        converted_time: DateTime<Utc>,
    ) -> Result<ConversionRecord, sqlx::Error> {
        sqlx::query_as::<_, ConversionRecord>(
            r#"
            INSERT INTO converted_files (
                filename, filepath, size, converted_time, endpoint, bucket, size_after
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, filename, filepath, size, converted_time, endpoint, bucket, size_after
            "#,
        )
        .bind(&object.key)
        .bind(self.context.filepath(&object.key))
        .bind(object.size)
        .bind(converted_time)
        .bind(&self.context.endpoint)
        .bind(&self.context.bucket)
        .bind(size_after)
        .fetch_one(&*self.db)
        .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::path::Path;

    /// A migrated ledger stored in `dir/ledger.db`.
    pub async fn ledger_in(dir: &Path, context: LedgerContext) -> LedgerService {
        let options = SqliteConnectOptions::new()
            .filename(dir.join("ledger.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .expect("open sqlite ledger");
        run_migrations(&pool).await.expect("migrate ledger");
        LedgerService::new(Arc::new(pool), context)
    }

    /// All rows recorded for a key in the ledger's bucket, oldest first.
    pub async fn records_for(ledger: &LedgerService, key: &str) -> Vec<ConversionRecord> {
        sqlx::query_as::<_, ConversionRecord>(
            "SELECT id, filename, filepath, size, converted_time, endpoint, bucket, size_after
             FROM converted_files
             WHERE filename = ? AND endpoint = ? AND bucket = ?
             ORDER BY id ASC",
        )
        .bind(key)
        .bind(&ledger.context.endpoint)
        .bind(&ledger.context.bucket)
        .fetch_all(&*ledger.db)
        .await
        .expect("query ledger rows")
    }

    pub fn context() -> LedgerContext {
        LedgerContext {
            endpoint: "https://s3.test".into(),
            bucket: "halorumah".into(),
            folder: "wp-content".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{context, ledger_in, records_for};
    use super::*;

    #[test]
    fn filepath_joins_folder_and_key() {
        let ctx = context();
        assert_eq!(ctx.filepath("wp-content/a.png"), "wp-content/wp-content/a.png");

        let root = LedgerContext {
            folder: "/".into(),
            ..context()
        };
        assert_eq!(root.filepath("a.png"), "/a.png");

        let unset = LedgerContext {
            folder: String::new(),
            ..context()
        };
        assert_eq!(unset.filepath("dir/a.png"), "dir/a.png");
    }

    #[test]
    fn filepath_cleans_key_segments() {
        let ctx = context();
        assert_eq!(ctx.filepath("a//b/./c.png"), "wp-content/a/b/c.png");
        assert_eq!(ctx.filepath("x/../a.png"), "wp-content/a.png");
        assert_eq!(ctx.filepath("../../a.png"), "../a.png");
        assert_eq!(ctx.filepath("dir/"), "wp-content/dir");

        let trailing = LedgerContext {
            folder: "wp-content/".into(),
            ..context()
        };
        assert_eq!(trailing.filepath("/a.png"), "wp-content/a.png");
        assert_eq!(clean_path("/../a.png"), "/a.png");
        assert_eq!(clean_path("a/.."), ".");
    }

    #[tokio::test]
    async fn empty_ledger_has_no_conversions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path(), context()).await;

        assert_eq!(ledger.ping().await.unwrap(), 0);
        let candidate = ObjectDescriptor::new("a.png", 1000);
        assert!(!ledger.has_been_converted(&candidate).await.unwrap());
    }

    #[tokio::test]
    async fn size_before_or_after_conversion_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path(), context()).await;

        let original = ObjectDescriptor::new("a.png", 1000);
        let record = ledger.record(&original, 300, Utc::now()).await.unwrap();
        assert_eq!(record.size, 1000);
        assert_eq!(record.size_after, 300);
        assert_eq!(record.bucket.as_deref(), Some("halorumah"));
        assert_eq!(record.endpoint.as_deref(), Some("https://s3.test"));

        assert!(ledger.has_been_converted(&original).await.unwrap());
        let converted = ObjectDescriptor::new("a.png", 300);
        assert!(ledger.has_been_converted(&converted).await.unwrap());

        let changed = ObjectDescriptor::new("a.png", 450);
        assert!(!ledger.has_been_converted(&changed).await.unwrap());
        let other_key = ObjectDescriptor::new("b.png", 1000);
        assert!(!ledger.has_been_converted(&other_key).await.unwrap());
    }

    #[tokio::test]
    async fn rows_are_scoped_to_endpoint_and_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path(), context()).await;
        ledger
            .record(&ObjectDescriptor::new("a.png", 1000), 300, Utc::now())
            .await
            .unwrap();

        let other_bucket = LedgerService::new(
            ledger.db.clone(),
            LedgerContext {
                bucket: "elsewhere".into(),
                ..context()
            },
        );
        let candidate = ObjectDescriptor::new("a.png", 1000);
        assert!(!other_bucket.has_been_converted(&candidate).await.unwrap());
        assert!(records_for(&other_bucket, "a.png").await.is_empty());
        assert_eq!(records_for(&ledger, "a.png").await.len(), 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path(), context()).await;
        run_migrations(&ledger.db).await.expect("second migrate");
        assert_eq!(ledger.ping().await.unwrap(), 0);
    }
}

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    fs::{self, OpenOptions},
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

mod config;
mod errors;
mod models;
mod services;

use services::{
    conversion_service::{ConversionService, PipelineSettings},
    ledger_service::{LedgerContext, LedgerService, run_migrations},
    object_store::{ObjectStore, S3ObjectStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    init_logging(&cfg.log_file)?;

    tracing::info!("Starting webp-converter with config: {:?}", cfg);

    // --- Ensure staging directory exists ---
    if !cfg.staging_dir.exists() {
        fs::create_dir_all(&cfg.staging_dir).with_context(|| {
            format!("creating staging directory {}", cfg.staging_dir.display())
        })?;
        tracing::info!("Created staging directory at {}", cfg.staging_dir.display());
    }

    // --- Initialize ledger connection ---
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing ledger URL `{}`", cfg.database_url))?
        .create_if_missing(true);

    // Create parent directory if needed
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    tracing::debug!("Ledger database file => {:?}", options.get_filename());

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(
                u32::try_from(cfg.concurrency)
                    .context("concurrency does not fit a pool size")?
                    .saturating_add(1),
            )
            .connect_with(options)
            .await
            .context("connecting to ledger database")?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Ledger migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize store client and ledger ---
    let store = S3ObjectStore::connect(&cfg).await;
    store.check_bucket(&cfg.bucket).await?;

    let ledger = LedgerService::new(
        db.clone(),
        LedgerContext {
            endpoint: store.endpoint().to_string(),
            bucket: cfg.bucket.clone(),
            folder: cfg.folder.clone(),
        },
    );
    let existing = ledger
        .ping()
        .await
        .context("ledger table `converted_files` is not reachable; run with --migrate first")?;
    tracing::info!("Ledger holds {} conversion records", existing);

    let service = ConversionService::new(Arc::new(store), ledger, PipelineSettings::from(&cfg));

    // --- Ctrl-C cancels the run; in-flight items still clean up ---
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    let run_id = Uuid::new_v4();
    let summary = service
        .run(cancel)
        .instrument(tracing::info_span!("run", %run_id))
        .await;

    tracing::info!(
        listed = summary.listed,
        listing_errors = summary.listing_errors,
        skipped_not_image = summary.skipped_not_image,
        skipped_converted = summary.skipped_converted,
        converted = summary.converted,
        failed = summary.failures.len(),
        cancelled = summary.cancelled,
        bytes_before = summary.bytes_before,
        bytes_after = summary.bytes_after,
        "Run {} complete",
        run_id
    );
    if summary.untracked_uploads > 0 {
        tracing::warn!(
            "{} objects were overwritten with WebP but could not be recorded in the ledger",
            summary.untracked_uploads
        );
    }

    db.close().await;
    Ok(())
}

/// Log to stdout and append the same lines (without colors) to `log_file`.
fn init_logging(log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();

    Ok(())
}

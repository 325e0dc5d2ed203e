use crate::services::image_codec::{DEFAULT_WEBP_QUALITY, WebpSettings};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Upper bound on parallel workers; each one also holds a ledger connection.
pub const MAX_CONCURRENCY: usize = 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; immutable once resolved.
#[derive(Clone)]
pub struct AppConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    pub folder: String,
    pub database_url: String,
    pub concurrency: usize,
    pub webp: WebpSettings,
    pub staging_dir: PathBuf,
    pub log_file: PathBuf,
    pub request_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Convert bucket images to WebP in place")]
pub struct Args {
    /// File of KEY=value settings loaded into the environment first
    #[arg(long, default_value = "local.env")]
    pub env_file: PathBuf,

    /// Store endpoint, e.g. https://minio.local:9000 (overrides S3_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Bucket to scan (overrides S3_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Key prefix to scan recursively (overrides S3_FOLDER)
    #[arg(long)]
    pub folder: Option<String>,

    /// Ledger database URL (overrides LEDGER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum objects processed at once (overrides CONVERTER_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// WebP quality 0-100 (overrides WEBP_QUALITY)
    #[arg(long)]
    pub quality: Option<f32>,

    /// Encode lossless WebP (overrides WEBP_LOSSLESS)
    #[arg(long)]
    pub lossless: bool,

    /// Directory for downloaded files (overrides CONVERTER_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Append-only log file (overrides CONVERTER_LOG_FILE)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Create the ledger table and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse CLI args, load the env file, and merge with the process environment.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        if args.env_file.exists() {
            dotenvy::from_path(&args.env_file)
                .with_context(|| format!("loading env file {}", args.env_file.display()))?;
        }

        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over settings read through `lookup`.
    ///
    /// Missing or empty required settings are errors.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => bail!("missing required setting {}", key),
            }
        };

        let endpoint = match args.endpoint {
            Some(endpoint) => endpoint,
            None => required("S3_ENDPOINT")?,
        };
        let access_key = required("S3_ACCESS_KEY")?;
        let secret_key = required("S3_SECRET_KEY")?;
        let database_url = match args.database_url {
            Some(url) => url,
            None => required("LEDGER_DATABASE_URL")?,
        };
        let bucket = match args.bucket {
            Some(bucket) => bucket,
            None => required("S3_BUCKET")?,
        };
        let folder = match args.folder {
            Some(folder) => folder,
            None => required("S3_FOLDER")?,
        };

        let region = lookup("S3_REGION").unwrap_or_else(|| "us-east-1".into());
        let timeout_secs: u64 = parse_setting(&lookup, "S3_TIMEOUT_SECS", 300)?;
        let concurrency = match args.concurrency {
            Some(value) => value,
            None => parse_setting(&lookup, "CONVERTER_CONCURRENCY", 4)?,
        };
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            bail!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY,
                concurrency
            );
        }

        let quality = match args.quality {
            Some(value) => value,
            None => parse_setting(&lookup, "WEBP_QUALITY", DEFAULT_WEBP_QUALITY)?,
        };
        if !(0.0..=100.0).contains(&quality) {
            bail!("WebP quality must be between 0 and 100, got {}", quality);
        }
        let lossless = args.lossless || parse_flag(&lookup, "WEBP_LOSSLESS")?;

        let staging_dir = args.staging_dir.unwrap_or_else(|| {
            lookup("CONVERTER_STAGING_DIR")
                .unwrap_or_else(|| "./downloaded".into())
                .into()
        });
        let log_file = args.log_file.unwrap_or_else(|| {
            lookup("CONVERTER_LOG_FILE")
                .unwrap_or_else(|| "conversion.log".into())
                .into()
        });

        Ok(Self {
            endpoint: normalize_endpoint(&endpoint),
            access_key,
            secret_key,
            region,
            bucket,
            folder,
            database_url,
            concurrency,
            webp: WebpSettings { quality, lossless },
            staging_dir,
            log_file,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

// Credentials stay out of the startup log line.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("folder", &self.folder)
            .field("database_url", &self.database_url)
            .field("concurrency", &self.concurrency)
            .field("webp", &self.webp)
            .field("staging_dir", &self.staging_dir)
            .field("log_file", &self.log_file)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn parse_setting<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => bail!("parsing {} value `{}`", key, other),
    }
}

/// Endpoints given as bare `host[:port]` are reached over HTTPS.
fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base() -> HashMap<String, String> {
        settings(&[
            ("S3_ENDPOINT", "minio.example.com"),
            ("S3_ACCESS_KEY", "access"),
            ("S3_SECRET_KEY", "secret"),
            ("LEDGER_DATABASE_URL", "sqlite://ledger.db"),
            ("S3_BUCKET", "halorumah"),
            ("S3_FOLDER", "wp-content"),
        ])
    }

    fn resolve(map: &HashMap<String, String>) -> Result<AppConfig> {
        AppConfig::resolve(Args::default(), |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_fill_optional_settings() {
        let cfg = resolve(&base()).expect("config");
        assert_eq!(cfg.endpoint, "https://minio.example.com");
        assert_eq!(cfg.bucket, "halorumah");
        assert_eq!(cfg.folder, "wp-content");
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.webp, WebpSettings::default());
        assert_eq!(cfg.staging_dir, PathBuf::from("./downloaded"));
        assert_eq!(cfg.log_file, PathBuf::from("conversion.log"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(300));
    }

    #[test]
    fn each_required_setting_is_enforced() {
        for key in [
            "S3_ENDPOINT",
            "S3_ACCESS_KEY",
            "S3_SECRET_KEY",
            "LEDGER_DATABASE_URL",
            "S3_BUCKET",
            "S3_FOLDER",
        ] {
            let mut map = base();
            map.remove(key);
            let err = resolve(&map).err().expect("missing setting must fail");
            assert!(err.to_string().contains(key), "{err}");

            let mut blank = base();
            blank.insert(key.to_string(), "  ".into());
            assert!(resolve(&blank).is_err(), "{key} blank");
        }
    }

    #[test]
    fn cli_args_override_environment() {
        let args = Args {
            bucket: Some("other".into()),
            concurrency: Some(2),
            quality: Some(80.0),
            lossless: true,
            ..Args::default()
        };
        let map = base();
        let cfg = AppConfig::resolve(args, |key| map.get(key).cloned()).expect("config");
        assert_eq!(cfg.bucket, "other");
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(
            cfg.webp,
            WebpSettings {
                quality: 80.0,
                lossless: true
            }
        );
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        for (key, value) in [
            ("WEBP_QUALITY", "101"),
            ("WEBP_QUALITY", "high"),
            ("CONVERTER_CONCURRENCY", "0"),
            ("CONVERTER_CONCURRENCY", "-1"),
            ("CONVERTER_CONCURRENCY", "1025"),
            ("CONVERTER_CONCURRENCY", "4294967295"),
            ("WEBP_LOSSLESS", "maybe"),
        ] {
            let mut map = base();
            map.insert(key.into(), value.into());
            assert!(resolve(&map).is_err(), "{key}={value}");
        }
    }

    #[test]
    fn concurrency_limit_is_inclusive() {
        let mut map = base();
        map.insert("CONVERTER_CONCURRENCY".into(), MAX_CONCURRENCY.to_string());
        assert_eq!(resolve(&map).unwrap().concurrency, MAX_CONCURRENCY);

        let args = Args {
            concurrency: Some(MAX_CONCURRENCY + 1),
            ..Args::default()
        };
        let map = base();
        assert!(AppConfig::resolve(args, |key| map.get(key).cloned()).is_err());
    }

    #[test]
    fn endpoint_scheme_is_preserved() {
        let mut map = base();
        map.insert("S3_ENDPOINT".into(), "http://localhost:9000/".into());
        assert_eq!(resolve(&map).unwrap().endpoint, "http://localhost:9000");
    }

    #[test]
    fn debug_output_hides_credentials() {
        let rendered = format!("{:?}", resolve(&base()).unwrap());
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("access"));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

pub const DEFAULT_STORAGE_IMAGE: &str = "minio/minio:RELEASE.2024-10-13T13-34-11Z";
pub const DEFAULT_CATALOG_IMAGE: &str = "tabulario/iceberg-rest:1.6.0";
pub const DEFAULT_QUERY_ENGINE_IMAGE: &str = "trinodb/trino:467";

/// Configuration for one disposable stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Object-storage image.
    pub storage_image: String,
    /// Metadata catalog image.
    pub catalog_image: String,
    /// Query-engine image.
    pub query_engine_image: String,
    /// Bucket created inside object storage and used as the warehouse root.
    pub bucket: String,
    /// Catalog name the query engine exposes (and fixtures run against).
    pub catalog: String,
    /// User reported to the query engine.
    pub query_user: String,
    pub storage_access_key: String,
    pub storage_secret_key: SecretString,
    pub region: String,
    /// Root directory holding the `create/` and `insert/` fixture folders.
    pub fixtures_dir: Option<PathBuf>,
    pub storage_timeout: Duration,
    pub catalog_timeout: Duration,
    pub query_engine_timeout: Duration,
    /// Initial interval between readiness polls.
    pub poll_interval: Duration,
    /// Upper bound on a single exec call. `None` leaves exec bounded only by
    /// caller cancellation.
    pub exec_timeout: Option<Duration>,
    /// Grace period given to a container before it is killed on stop.
    pub stop_timeout: Duration,
    /// Pull images that are not present locally.
    pub auto_pull: bool,
    /// Address on which published ports are bound and reached.
    pub host_address: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            storage_image: DEFAULT_STORAGE_IMAGE.to_string(),
            catalog_image: DEFAULT_CATALOG_IMAGE.to_string(),
            query_engine_image: DEFAULT_QUERY_ENGINE_IMAGE.to_string(),
            bucket: "warehouse".to_string(),
            catalog: "iceberg".to_string(),
            query_user: "icestack".to_string(),
            storage_access_key: "admin".to_string(),
            storage_secret_key: SecretString::from("password".to_string()),
            region: "us-east-1".to_string(),
            fixtures_dir: None,
            storage_timeout: Duration::from_secs(60),
            catalog_timeout: Duration::from_secs(60),
            query_engine_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(250),
            exec_timeout: None,
            stop_timeout: Duration::from_secs(10),
            auto_pull: true,
            host_address: "127.0.0.1".to_string(),
        }
    }
}

impl StackConfig {
    /// Resolve configuration from the environment (and `.env`, if present).
    pub fn resolve() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let bucket = optional_env("ICESTACK_BUCKET")?.unwrap_or(defaults.bucket);

        let exec_timeout = optional_env("ICESTACK_EXEC_TIMEOUT_SECS")?
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "ICESTACK_EXEC_TIMEOUT_SECS".to_string(),
                        message: e.to_string(),
                    })
            })
            .transpose()?;

        let config = Self {
            storage_image: optional_env("ICESTACK_STORAGE_IMAGE")?
                .unwrap_or(defaults.storage_image),
            catalog_image: optional_env("ICESTACK_CATALOG_IMAGE")?
                .unwrap_or(defaults.catalog_image),
            query_engine_image: optional_env("ICESTACK_QUERY_ENGINE_IMAGE")?
                .unwrap_or(defaults.query_engine_image),
            bucket,
            catalog: optional_env("ICESTACK_CATALOG")?.unwrap_or(defaults.catalog),
            query_user: optional_env("ICESTACK_QUERY_USER")?.unwrap_or(defaults.query_user),
            storage_access_key: optional_env("ICESTACK_STORAGE_ACCESS_KEY")?
                .unwrap_or(defaults.storage_access_key),
            storage_secret_key: optional_env("ICESTACK_STORAGE_SECRET_KEY")?
                .map(SecretString::from)
                .unwrap_or(defaults.storage_secret_key),
            region: optional_env("ICESTACK_REGION")?.unwrap_or(defaults.region),
            fixtures_dir: optional_env("ICESTACK_FIXTURES_DIR")?.map(PathBuf::from),
            storage_timeout: Duration::from_secs(parse_optional_env(
                "ICESTACK_STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout.as_secs(),
            )?),
            catalog_timeout: Duration::from_secs(parse_optional_env(
                "ICESTACK_CATALOG_TIMEOUT_SECS",
                defaults.catalog_timeout.as_secs(),
            )?),
            query_engine_timeout: Duration::from_secs(parse_optional_env(
                "ICESTACK_QUERY_ENGINE_TIMEOUT_SECS",
                defaults.query_engine_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_optional_env(
                "ICESTACK_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            exec_timeout,
            stop_timeout: Duration::from_secs(parse_optional_env(
                "ICESTACK_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
            auto_pull: parse_bool_env("ICESTACK_AUTO_PULL", defaults.auto_pull)?,
            host_address: optional_env("ICESTACK_HOST_ADDRESS")?
                .unwrap_or(defaults.host_address),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the names that end up in container commands and file paths.
    ///
    /// Fields are public, so configs built by hand are checked again when the
    /// stack starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bucket_name(&self.bucket)?;
        validate_catalog_name(&self.catalog)
    }

    /// Storage secret key (exposes the secret).
    pub fn storage_secret_key(&self) -> &str {
        self.storage_secret_key.expose_secret()
    }

    /// Warehouse location inside object storage.
    pub fn warehouse_uri(&self) -> String {
        format!("s3://{}/", self.bucket)
    }
}

/// Bucket names follow the S3 rules the storage service enforces.
fn validate_bucket_name(bucket: &str) -> Result<(), ConfigError> {
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if (3..=63).contains(&bucket.len()) && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "ICESTACK_BUCKET".to_string(),
            message: format!(
                "'{bucket}' must be 3-63 characters of lowercase letters, digits, '-' or '.'"
            ),
        })
    }
}

/// Catalog names become a properties file name inside the query engine.
fn validate_catalog_name(catalog: &str) -> Result<(), ConfigError> {
    let starts_with_letter = catalog.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_chars = catalog
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if starts_with_letter && valid_chars {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "ICESTACK_CATALOG".to_string(),
            message: format!(
                "'{catalog}' must start with a lowercase letter and contain only lowercase letters, digits or '_'"
            ),
        })
    }
}

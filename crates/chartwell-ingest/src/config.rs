//! Configuration management
//!
//! Everything is read from the environment (after loading a `.env` file if one
//! exists), falling back to the defaults below.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::file_store::s3::S3Config;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/chartwell";

/// Default timeout for establishing the gateway connection.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Rows per batch-insert round-trip.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Rows examined by the schema mapper on first import.
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Jobs the coordinator lets run at once.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Per-attempt timeout for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Retries after the first attempt of an outbound request.
pub const DEFAULT_REQUEST_MAX_RETRIES: u32 = 3;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub file_store: FileStoreConfig,
    pub pipeline: PipelineConfig,
    pub requests: RequestDefaults,
    /// Base URL of the source registry service; in-memory registry when unset
    pub registry_url: Option<String>,
}

/// Storage gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Which file store implementation backs uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileStoreBackend {
    #[default]
    Memory,
    S3,
}

impl FromStr for FileStoreBackend {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(FileStoreBackend::Memory),
            "s3" | "minio" => Ok(FileStoreBackend::S3),
            other => Err(IngestError::Config(format!("Unknown file store backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    pub backend: FileStoreBackend,
    pub s3: S3Config,
}

/// Knobs handed to every import job by the factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub sample_size: usize,
    pub max_concurrent_jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

impl PipelineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::Config("INGEST_BATCH_SIZE must be greater than 0".into()));
        }
        if self.sample_size == 0 {
            return Err(IngestError::Config("INGEST_SAMPLE_SIZE must be greater than 0".into()));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(IngestError::Config(
                "INGEST_MAX_CONCURRENT_JOBS must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults applied to request envelopes built by the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_REQUEST_MAX_RETRIES,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match std::env::var("FILE_STORE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => FileStoreBackend::default(),
        };

        let config = IngestConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            file_store: FileStoreConfig {
                backend,
                s3: S3Config::from_env(),
            },
            pipeline: PipelineConfig {
                batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                sample_size: env_or("INGEST_SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE),
                max_concurrent_jobs: env_or(
                    "INGEST_MAX_CONCURRENT_JOBS",
                    DEFAULT_MAX_CONCURRENT_JOBS,
                ),
            },
            requests: RequestDefaults {
                timeout_ms: env_or("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
                max_retries: env_or("REQUEST_MAX_RETRIES", DEFAULT_REQUEST_MAX_RETRIES),
            },
            registry_url: std::env::var("SOURCE_REGISTRY_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::Config("Database URL cannot be empty".into()));
        }

        self.pipeline.validate()?;

        if self.requests.timeout_ms == 0 {
            tracing::warn!("REQUEST_TIMEOUT_MS is 0 - outbound requests will time out immediately");
        }

        if self.file_store.backend == FileStoreBackend::S3 && self.file_store.s3.bucket.is_empty() {
            return Err(IngestError::Config("S3_BUCKET cannot be empty".into()));
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            file_store: FileStoreConfig {
                backend: FileStoreBackend::Memory,
                s3: S3Config::default(),
            },
            pipeline: PipelineConfig::default(),
            requests: RequestDefaults::default(),
            registry_url: None,
        }
    }
}

//! Configuration management for the blob store

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling on a single blob: 500MB
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 500 * 1024 * 1024;

/// Default idle period before an upload is aborted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_path: PathBuf,
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Memory,
    S3,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// SQLite URL; `None` keeps metadata in memory only
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub idle_timeout: Duration,
    pub max_blob_size: u64,
    /// 0 = unlimited
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_concurrent_uploads: 0,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                backend: StorageBackend::Local,
                local_path: PathBuf::from("./data/blobs"),
                s3: None,
            },
            catalog: CatalogConfig {
                url: Some("sqlite:./data/catalog.db".to_string()),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match var("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageBackend::Local,
            "memory" => StorageBackend::Memory,
            "s3" => StorageBackend::S3,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let s3 = if backend == StorageBackend::S3 {
            Some(S3Config {
                endpoint: required(&var, "S3_ENDPOINT")?,
                bucket: required(&var, "S3_BUCKET")?,
                access_key: required(&var, "S3_ACCESS_KEY")?,
                secret_key: required(&var, "S3_SECRET_KEY")?,
                region: var("S3_REGION"),
                prefix: var("S3_PREFIX").unwrap_or_else(|| "blobs".to_string()),
            })
        } else {
            None
        };

        let catalog_url = match var("CATALOG_URL") {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url),
            None => Some("sqlite:./data/catalog.db".to_string()),
        };

        Ok(Config {
            server: ServerConfig {
                host: var("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parsed(&var, "SERVER_PORT", 3000)?,
            },
            storage: StorageConfig {
                backend,
                local_path: var("STORAGE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/blobs")),
                s3,
            },
            catalog: CatalogConfig { url: catalog_url },
            upload: UploadConfig {
                idle_timeout: Duration::from_secs(parsed(
                    &var,
                    "UPLOAD_IDLE_TIMEOUT_SECS",
                    DEFAULT_IDLE_TIMEOUT_SECS,
                )?),
                max_blob_size: parsed(&var, "MAX_BLOB_SIZE", DEFAULT_MAX_BLOB_SIZE)?,
                max_concurrent_uploads: parsed(&var, "MAX_CONCURRENT_UPLOADS", 0)?,
            },
        })
    }
}

fn required<F>(var: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(key).ok_or(ConfigError::Missing(key))
}

fn parsed<F, T>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(value) => {
            let result = value.trim().parse();
            result.map_err(|_| ConfigError::Invalid { key, value })
        }
        None => Ok(default),
    }
}

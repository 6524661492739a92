use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Unparseable(#[from] toml::de::Error),
    #[error("master key is not configured; set master_key or COFFER_MASTER_KEY")]
    MissingMasterKey,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:4430".parse().expect("valid default addr")
}

fn default_base_prefix() -> String {
    "/".to_string()
}

/// Maximum size of the metadata part of a multipart upload (5.2 MB)
pub const MAX_METADATA_BYTES: usize = 5 * 1024 * 1024 + 200 * 1024;

/// Maximum overall upload size in bytes (500 MB)
pub const MAX_UPLOAD_SIZE_BYTES: usize = 500 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address for the HTTP server to listen on
    pub listen_addr: SocketAddr,
    /// Prefix all routes live under, e.g. "/services/coffer/1.0"
    pub base_prefix: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen_addr: default_listen_addr(),
            base_prefix: default_base_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Root mount point of the cache location on disk
    pub root: PathBuf,
    /// Zone identifier; on-disk layout is <root>/<zone>/<fileID>.<state>
    pub zone: String,
    /// How long, in seconds, cached files remain before eviction eligibility
    pub evict_age_seconds: u64,
    /// Usage fraction below which no eviction happens
    pub low_watermark: f64,
    /// Usage fraction above which eviction ignores the age threshold
    pub high_watermark: f64,
    /// Capacity against which usage fractions are computed
    pub capacity_bytes: u64,
    /// Seconds between cache walker passes
    pub walk_sleep_seconds: u64,
    /// Size of blocks pulled from durable storage, in megabytes
    pub chunk_size_mb: u64,
    /// Max number of cached files to keep; zero means unlimited
    pub file_limit: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        DiskCacheConfig {
            root: PathBuf::from("coffer-cache"),
            zone: "default".to_string(),
            evict_age_seconds: 3600,
            low_watermark: 0.50,
            high_watermark: 0.75,
            capacity_bytes: 10 * 1024 * 1024 * 1024,
            walk_sleep_seconds: 30,
            chunk_size_mb: 16,
            file_limit: 0,
        }
    }
}

/// Durable storage backend selection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum StorageConfig {
    /// No durable storage; the cache never drains and peers are the only
    /// remote source
    #[default]
    None,
    S3 {
        bucket: String,
    },
    File {
        root: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// NATS server to publish global events to; absent means the no-op
    /// producer
    pub nats_url: Option<String>,
    pub subject: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            nats_url: None,
            subject: "coffer.events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Base URLs of peer replicas, e.g. "https://node-b:4430"
    pub urls: Vec<String>,
    /// Reserved caller DN marking peer-to-peer ciphertext fetches
    pub signifier: String,
    pub enabled: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            urls: Vec::new(),
            signifier: "cn=coffer peer,ou=services".to_string(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub cache: DiskCacheConfig,
    pub storage: StorageConfig,
    pub audit: AuditConfig,
    pub peers: PeerConfig,
    /// Master passphrase wrapping per-object file keys. Required; the
    /// COFFER_MASTER_KEY environment variable overrides the file value.
    pub master_key: String,
    /// DNs permitted to impersonate users via the USER_DN header
    pub impersonation_whitelist: Vec<String>,
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides. A missing master key is fatal at startup.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };
        if let Ok(master) = std::env::var("COFFER_MASTER_KEY") {
            config.master_key = master;
        }
        if let Ok(addr) = std::env::var("COFFER_LISTEN_ADDR") {
            if let Ok(addr) = addr.parse() {
                config.http.listen_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("COFFER_NATS_URL") {
            config.audit.nats_url = Some(url);
        }
        if config.master_key.is_empty() {
            return Err(ConfigError::MissingMasterKey);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.http.base_prefix, "/");
        assert!(matches!(config.storage, StorageConfig::None));
        assert_eq!(config.cache.zone, "default");
    }

    #[test]
    fn test_storage_backend_selection() {
        let config: Config = toml::from_str(
            r#"
            master_key = "k"
            [storage]
            backend = "s3"
            bucket = "ciphertext"
            "#,
        )
        .unwrap();
        assert!(matches!(config.storage, StorageConfig::S3 { ref bucket } if bucket == "ciphertext"));
    }
}

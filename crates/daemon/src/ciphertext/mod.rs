//! Tiered ciphertext storage
//!
//! Uploaded ciphertext is staged on local disk, drained to durable storage
//! in the background, and faulted back from durable storage or a peer
//! replica on reads. The filename suffix is the lock-free state machine:
//! rename is the commit point, and any process seeing a `.cached` file may
//! read it.

pub mod cache;
pub mod peer;
pub mod permanent;
pub mod puller;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{CacheError, CiphertextCache};
pub use peer::PeerFetcher;
pub use permanent::{FileStorage, PermanentStorage, S3Storage, StorageError};
pub use puller::Puller;

/// Identifier of the cache partition a blob lives under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone(String);

impl Zone {
    pub fn new(zone: impl Into<String>) -> Self {
        Zone(zone.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur parsing file identifiers
#[derive(Debug, thiserror::Error)]
#[error("invalid ciphertext file id")]
pub struct FileIdError;

/// Random name identifying one ciphertext blob in cache and durable storage.
/// Always lowercase hex, which also keeps path handling safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn generate() -> Self {
        FileId(common::crypto::create_random_name())
    }

    /// Parse an identifier received over the wire. Only lowercase hex names
    /// of the expected length are accepted.
    pub fn parse(s: &str) -> Result<Self, FileIdError> {
        let expected = s.len() == 64 || s == "canary";
        if !expected {
            return Err(FileIdError);
        }
        if s != "canary" && !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(FileIdError);
        }
        Ok(FileId(s.to_string()))
    }

    /// The reserved name holding the master key canary
    pub fn canary() -> Self {
        FileId("canary".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a cache entry, encoded as the filename suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Bytes being written by the upload handler
    Uploading,
    /// Upload complete, queued for drain to durable storage
    Uploaded,
    /// A fetch from durable storage or a peer is in flight
    Caching,
    /// Present durably and locally
    Cached,
    /// Upload aborted before the metadata commit
    Orphaned,
}

impl FileState {
    pub fn suffix(&self) -> &'static str {
        match self {
            FileState::Uploading => ".uploading",
            FileState::Uploaded => ".uploaded",
            FileState::Caching => ".caching",
            FileState::Cached => ".cached",
            FileState::Orphaned => ".orphaned",
        }
    }
}

/// On-disk file name for a blob in a given state
pub fn file_name(id: &FileId, state: FileState) -> String {
    format!("{}{}", id, state.suffix())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_id_parse() {
        let id = FileId::generate();
        assert!(FileId::parse(id.as_str()).is_ok());
        assert!(FileId::parse("canary").is_ok());
        assert!(FileId::parse("../etc/passwd").is_err());
        assert!(FileId::parse(&"A".repeat(64)).is_err());
        assert!(FileId::parse("abc").is_err());
    }

    #[test]
    fn test_file_name_suffixes() {
        let id = FileId::parse(&"ab".repeat(32)).unwrap();
        assert!(file_name(&id, FileState::Uploaded).ends_with(".uploaded"));
        assert!(file_name(&id, FileState::Cached).ends_with(".cached"));
    }
}

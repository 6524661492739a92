use std::fs::FileTimes;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::crypto::MasterKey;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::service_config::DiskCacheConfig;

use super::peer::PeerFetcher;
use super::permanent::{PermanentStorage, StorageError};
use super::{file_name, FileId, FileState, Zone};

/// Errors surfaced by the ciphertext cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("ciphertext not found")]
    NotFound,
    #[error("another fetch of the same ciphertext did not complete")]
    FetchContended,
    #[error("master key canary mismatch: cluster members disagree on the master key (have {have}, expect {expect})")]
    CanaryMismatch { have: String, expect: String },
}

/// Local staging for encrypted blobs, backed by durable storage.
///
/// Uploads land as `.uploading` files, commit to `.uploaded` on EOF, and a
/// background drainer promotes them to durable storage before renaming to
/// `.cached`. Reads prefer the local copy and otherwise fault bytes back
/// from durable storage or a peer replica. Eviction walks `.cached` files by
/// age once usage crosses the low watermark.
pub struct CiphertextCache {
    zone: Zone,
    location: PathBuf,
    permanent: Option<Arc<dyn PermanentStorage>>,
    peers: Option<Arc<PeerFetcher>>,
    pub chunk_size: u64,
    evict_age: Duration,
    low_watermark: f64,
    high_watermark: f64,
    capacity_bytes: u64,
    pub walk_sleep: Duration,
    file_limit: u64,
}

impl CiphertextCache {
    /// Open the cache directory, clean up interrupted transfers, and verify
    /// the master key canary. A canary mismatch is fatal: it means cluster
    /// members disagree about the master key.
    pub async fn open(
        zone: Zone,
        config: &DiskCacheConfig,
        permanent: Option<Arc<dyn PermanentStorage>>,
        peers: Option<Arc<PeerFetcher>>,
        master: &MasterKey,
    ) -> Result<Arc<Self>, CacheError> {
        let location = config.root.join(zone.as_str());
        tokio::fs::create_dir_all(&location).await?;

        let cache = Arc::new(CiphertextCache {
            zone,
            location,
            permanent,
            peers,
            chunk_size: config.chunk_size_mb.max(1) * 1024 * 1024,
            evict_age: Duration::from_secs(config.evict_age_seconds),
            low_watermark: config.low_watermark,
            high_watermark: config.high_watermark,
            capacity_bytes: config.capacity_bytes.max(1),
            walk_sleep: Duration::from_secs(config.walk_sleep_seconds.max(1)),
            file_limit: config.file_limit,
        });
        cache.cleanup_startup().await?;
        cache.master_key_check(master).await?;
        tracing::info!(
            zone = %cache.zone,
            location = %cache.location.display(),
            "ciphertext cache opened"
        );
        Ok(cache)
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub(crate) fn path(&self, id: &FileId, state: FileState) -> PathBuf {
        self.location.join(file_name(id, state))
    }

    /// Key of the blob in durable storage
    fn storage_key(&self, id: &FileId) -> String {
        format!("{}/{}", self.zone, id)
    }

    /// Remove transfer states that cannot survive a restart. A `.caching`
    /// file locks a download, and its owner is gone; `.uploading` files
    /// never reached their EOF commit.
    async fn cleanup_startup(&self) -> Result<(), CacheError> {
        let mut entries = tokio::fs::read_dir(&self.location).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(FileState::Caching.suffix())
                || name.ends_with(FileState::Uploading.suffix())
                || name.ends_with(FileState::Orphaned.suffix())
            {
                tracing::info!(file = %name, "removing interrupted transfer");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    async fn master_key_check(&self, master: &MasterKey) -> Result<(), CacheError> {
        let expected = master.canary();
        let canary = FileId::canary();

        let have = match self.read_canary(&canary).await {
            Ok(Some(have)) => have,
            Ok(None) => {
                tracing::info!(expect = %expected, "ciphertext cache canary is being set");
                return self.write_canary(&canary, &expected).await;
            }
            Err(e) => return Err(e),
        };

        if have != expected {
            // Remove the stale local copy so a corrected configuration can
            // recover on the next start.
            let _ = tokio::fs::remove_file(self.path(&canary, FileState::Cached)).await;
            return Err(CacheError::CanaryMismatch {
                have,
                expect: expected,
            });
        }
        tracing::info!("ciphertext cache canary is a positive match");
        Ok(())
    }

    async fn read_canary(&self, canary: &FileId) -> Result<Option<String>, CacheError> {
        let cached = self.path(canary, FileState::Cached);
        match tokio::fs::read_to_string(&cached).await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            Err(_) => {}
        }
        let Some(permanent) = self.permanent.as_ref() else {
            return Ok(None);
        };
        match permanent
            .download(&self.storage_key(canary), &cached)
            .await
        {
            Ok(_) => Ok(Some(tokio::fs::read_to_string(&cached).await?)),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_canary(&self, canary: &FileId, expected: &str) -> Result<(), CacheError> {
        let uploaded = self.path(canary, FileState::Uploaded);
        tokio::fs::write(&uploaded, expected).await?;
        self.writeback(canary).await
    }

    /// Begin staging an upload; the handler writes ciphertext to the
    /// returned file.
    pub async fn begin_upload(&self, id: &FileId) -> Result<tokio::fs::File, CacheError> {
        Ok(tokio::fs::File::create(self.path(id, FileState::Uploading)).await?)
    }

    /// Commit a completed upload. Rename is the commit point; after this the
    /// blob is drain-eligible and readable.
    pub async fn commit_upload(&self, id: &FileId) -> Result<(), CacheError> {
        tokio::fs::rename(
            self.path(id, FileState::Uploading),
            self.path(id, FileState::Uploaded),
        )
        .await?;
        Ok(())
    }

    /// Abort an in-flight upload, removing the partial file
    pub async fn abort_upload(&self, id: &FileId) {
        let _ = tokio::fs::remove_file(self.path(id, FileState::Uploading)).await;
    }

    /// Drain one blob to durable storage. The local copy is never lost: on
    /// upload failure the `.uploaded` file stays for the next pass.
    pub async fn writeback(&self, id: &FileId) -> Result<(), CacheError> {
        let uploaded = self.path(id, FileState::Uploaded);
        let cached = self.path(id, FileState::Cached);

        let size = match tokio::fs::metadata(&uploaded).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Already drained by another pass
                if tokio::fs::metadata(&cached).await.is_ok() {
                    return Ok(());
                }
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        if size > 0 {
            if let Some(permanent) = self.permanent.as_ref() {
                let key = self.storage_key(id);
                tracing::debug!(bucket = %permanent.name(), key = %key, "writeback to permanent storage");
                permanent.upload(&key, &uploaded).await?;
            }
        }

        tokio::fs::rename(&uploaded, &cached).await?;
        Ok(())
    }

    /// Scan for `.uploaded` files and drain them, retrying transient storage
    /// failures with backoff. Returns the number of blobs drained.
    pub async fn drain_once(&self) -> usize {
        let mut drained = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.location).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(FileState::Uploaded.suffix()) else {
                continue;
            };
            let Ok(id) = FileId::parse(stem) else {
                continue;
            };
            tracing::info!(id = %id, "there is an uploaded file to drain");
            let mut wait = Duration::from_secs(1);
            let mut previous = Duration::from_secs(0);
            let mut tries = 3;
            loop {
                match self.writeback(&id).await {
                    Ok(()) => {
                        drained += 1;
                        break;
                    }
                    Err(e) => {
                        tries -= 1;
                        if tries == 0 {
                            tracing::warn!(id = %id, error = %e, "error draining cache");
                            break;
                        }
                        tokio::time::sleep(wait).await;
                        let next = wait + previous;
                        previous = wait;
                        wait = next;
                    }
                }
            }
        }
        drained
    }

    /// Open a local copy at `offset`, preferring `.cached`, falling back to
    /// `.uploaded` for blobs still waiting to drain. Access times are
    /// refreshed so the eviction walker sees the use.
    pub async fn open_local(
        &self,
        id: &FileId,
        offset: u64,
    ) -> Result<Option<tokio::fs::File>, CacheError> {
        for state in [FileState::Cached, FileState::Uploaded] {
            let path = self.path(id, state);
            match tokio::fs::File::open(&path).await {
                Ok(mut file) => {
                    file.seek(SeekFrom::Start(offset)).await?;
                    let now = SystemTime::now();
                    let times = FileTimes::new().set_accessed(now).set_modified(now);
                    let std_path = path.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        std::fs::OpenOptions::new()
                            .append(true)
                            .open(&std_path)
                            .and_then(|f| f.set_times(times))
                    })
                    .await;
                    return Ok(Some(file));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    pub async fn has_local(&self, id: &FileId) -> bool {
        for state in [FileState::Cached, FileState::Uploaded] {
            if tokio::fs::metadata(self.path(id, state)).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Fetch a whole blob back into the cache from durable storage or a
    /// peer. A `.caching` file locks the download; when another fetch is in
    /// flight this waits for it to complete instead of duplicating work.
    pub async fn recache(self: &Arc<Self>, id: &FileId) -> Result<(), CacheError> {
        let cached = self.path(id, FileState::Cached);
        if tokio::fs::metadata(&cached).await.is_ok() {
            return Ok(());
        }

        let caching = self.path(id, FileState::Caching);
        if tokio::fs::metadata(&caching).await.is_ok() {
            return self.wait_for_cached(id).await;
        }

        let result = self.recache_locked(id, &caching, &cached).await;
        // The lock file must only exist while this fetch runs
        let _ = tokio::fs::remove_file(&caching).await;
        result
    }

    async fn recache_locked(
        &self,
        id: &FileId,
        caching: &PathBuf,
        cached: &PathBuf,
    ) -> Result<(), CacheError> {
        let key = self.storage_key(id);

        let mut last_error: Option<CacheError> = None;
        if let Some(permanent) = self.permanent.as_ref() {
            tracing::info!(key = %key, "recache from permanent storage");
            let mut wait = Duration::from_secs(1);
            let mut previous = Duration::from_secs(0);
            let mut tries = 4;
            loop {
                match permanent.download(&key, caching).await {
                    Ok(_) => {
                        tokio::fs::rename(caching, cached).await?;
                        tracing::info!(id = %id, "fetched ciphertext");
                        return Ok(());
                    }
                    Err(StorageError::NotFound) => {
                        last_error = Some(CacheError::NotFound);
                        break;
                    }
                    Err(e) => {
                        tries -= 1;
                        tracing::info!(error = %e, tries, "download from permanent storage was not successful");
                        last_error = Some(e.into());
                        if tries == 0 {
                            break;
                        }
                        tokio::time::sleep(wait).await;
                        let next = wait + previous;
                        previous = wait;
                        wait = next;
                    }
                }
            }
        }

        // Not durably stored (or no durable storage at all); a peer that
        // still holds its local copy is the remaining source.
        if let Some(peers) = self.peers.as_ref().filter(|p| p.enabled()) {
            match peers.fetch(&self.zone, id, 0).await {
                Ok(mut response) => {
                    let mut out = tokio::fs::File::create(caching).await?;
                    while let Some(chunk) = response.chunk().await.map_err(|e| {
                        CacheError::Storage(StorageError::Unavailable(anyhow::anyhow!(
                            "peer stream failed: {}",
                            e
                        )))
                    })? {
                        out.write_all(&chunk).await?;
                    }
                    out.flush().await?;
                    drop(out);
                    tokio::fs::rename(caching, cached).await?;
                    tracing::info!(id = %id, "peer recache success");
                    return Ok(());
                }
                Err(e) => {
                    tracing::info!(id = %id, error = %e, "peer cannot provide ciphertext");
                }
            }
        }

        Err(last_error.unwrap_or(CacheError::NotFound))
    }

    /// Wait for a concurrent fetch of the same blob to land its `.cached`
    /// file. The stall doubles up to a bound, then gives up.
    async fn wait_for_cached(&self, id: &FileId) -> Result<(), CacheError> {
        let cached = self.path(id, FileState::Cached);
        let mut wait = Duration::from_millis(250);
        let deadline = Duration::from_secs(30);
        let mut waited = Duration::from_secs(0);
        while waited < deadline {
            if tokio::fs::metadata(&cached).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(wait).await;
            waited += wait;
            if wait < Duration::from_secs(8) {
                wait *= 2;
            }
        }
        Err(CacheError::FetchContended)
    }

    /// Fire-and-forget whole-file recache after a cache miss. Runs to
    /// completion even if the requesting client disconnects.
    pub fn background_recache(self: &Arc<Self>, id: FileId) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = cache.recache(&id).await {
                tracing::warn!(id = %id, error = %e, "background recache failed");
            } else {
                tracing::info!(id = %id, "background recache done");
            }
        });
    }

    /// One pass of the eviction walker. Only `.cached` files are eligible;
    /// below the low watermark nothing is evicted, between the watermarks
    /// files older than the eviction age go, and above the high watermark
    /// age no longer protects a file.
    pub async fn evict_once(&self) -> Result<usize, CacheError> {
        let mut entries = tokio::fs::read_dir(&self.location).await?;
        let mut candidates: Vec<(PathBuf, u64, Duration)> = Vec::new();
        let mut total_bytes = 0u64;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(FileState::Cached.suffix()) || name.starts_with("canary") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            total_bytes += meta.len();
            let used = meta
                .accessed()
                .or_else(|_| meta.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            candidates.push((entry.path(), meta.len(), used));
        }

        let usage = total_bytes as f64 / self.capacity_bytes as f64;
        let over_limit =
            self.file_limit > 0 && candidates.len() as u64 > self.file_limit;
        if usage < self.low_watermark && !over_limit {
            return Ok(0);
        }

        // Oldest first
        candidates.sort_by(|a, b| b.2.cmp(&a.2));

        let mut evicted = 0;
        let mut remaining_bytes = total_bytes;
        let mut remaining_files = candidates.len() as u64;
        for (path, len, idle) in candidates {
            let usage = remaining_bytes as f64 / self.capacity_bytes as f64;
            let over_limit = self.file_limit > 0 && remaining_files > self.file_limit;
            let age_eligible = idle >= self.evict_age;
            let must_evict = usage >= self.high_watermark || over_limit;
            let may_evict = usage >= self.low_watermark && age_eligible;
            if !(must_evict || may_evict) {
                break;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                tracing::info!(file = %path.display(), "evicted cached ciphertext");
                evicted += 1;
                remaining_bytes = remaining_bytes.saturating_sub(len);
                remaining_files -= 1;
            }
        }
        Ok(evicted)
    }

    /// Number of `.uploaded` files not yet drained to durable storage
    pub async fn count_uploaded(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.location).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(FileState::Uploaded.suffix()) {
                if let Ok(meta) = entry.metadata().await {
                    if meta.len() > 0 {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Inventory of cache entries for the stats page. Uploaded files are
    /// always listed; everything else only when verbose.
    pub async fn inventory(&self, verbose: bool) -> Vec<String> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.location).await else {
            return Vec::new();
        };
        let mut listing = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if verbose || name.ends_with(FileState::Uploaded.suffix()) {
                listing.push(name);
            }
        }
        listing.sort();
        listing
    }

    pub fn permanent(&self) -> Option<&Arc<dyn PermanentStorage>> {
        self.permanent.as_ref()
    }

    pub fn peer_fetcher(&self) -> Option<&Arc<PeerFetcher>> {
        self.peers.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ciphertext::FileStorage;

    fn config(root: &std::path::Path) -> DiskCacheConfig {
        DiskCacheConfig {
            root: root.to_path_buf(),
            capacity_bytes: 1024,
            evict_age_seconds: 0,
            ..Default::default()
        }
    }

    fn master() -> MasterKey {
        MasterKey::new("cache test key").unwrap()
    }

    async fn open_cache(
        root: &std::path::Path,
        storage: Option<Arc<dyn PermanentStorage>>,
    ) -> Arc<CiphertextCache> {
        CiphertextCache::open(
            Zone::new("default"),
            &config(root),
            storage,
            None,
            &master(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_commit_drain_read() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(store_dir.path()));
        let cache = open_cache(dir.path(), Some(storage)).await;

        let id = FileId::generate();
        let mut file = cache.begin_upload(&id).await.unwrap();
        file.write_all(b"ciphertext bytes").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        cache.commit_upload(&id).await.unwrap();

        // Readable while still only uploaded
        assert!(cache.open_local(&id, 0).await.unwrap().is_some());
        assert_eq!(cache.count_uploaded().await, 1);

        let drained = cache.drain_once().await;
        assert_eq!(drained, 1);
        assert_eq!(cache.count_uploaded().await, 0);
        assert!(cache.open_local(&id, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recache_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(store_dir.path()));
        let cache = open_cache(dir.path(), Some(storage)).await;

        let id = FileId::generate();
        let mut file = cache.begin_upload(&id).await.unwrap();
        file.write_all(b"bytes that will be evicted").await.unwrap();
        drop(file);
        cache.commit_upload(&id).await.unwrap();
        cache.drain_once().await;

        // Remove the local copy, then fault it back
        tokio::fs::remove_file(cache.path(&id, FileState::Cached))
            .await
            .unwrap();
        assert!(!cache.has_local(&id).await);
        cache.recache(&id).await.unwrap();
        assert!(cache.has_local(&id).await);
    }

    #[tokio::test]
    async fn test_recache_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(store_dir.path()));
        let cache = open_cache(dir.path(), Some(storage)).await;
        let missing = FileId::generate();
        assert!(matches!(
            cache.recache(&missing).await,
            Err(CacheError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_canary_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), None).await;
        drop(cache);

        let other = MasterKey::new("a different key").unwrap();
        let result = CiphertextCache::open(
            Zone::new("default"),
            &config(dir.path()),
            None,
            None,
            &other,
        )
        .await;
        assert!(matches!(result, Err(CacheError::CanaryMismatch { .. })));

        // Original key still opens
        let again = CiphertextCache::open(
            Zone::new("default"),
            &config(dir.path()),
            None,
            None,
            &master(),
        )
        .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_abort_removes_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), None).await;
        let id = FileId::generate();
        let mut file = cache.begin_upload(&id).await.unwrap();
        file.write_all(b"partial").await.unwrap();
        drop(file);
        cache.abort_upload(&id).await;
        assert!(!cache.has_local(&id).await);
        assert!(cache.open_local(&id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_once_respects_watermarks() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(store_dir.path()));
        // capacity 1024 bytes, low 0.5: two 400-byte blobs cross it
        let cache = open_cache(dir.path(), Some(storage)).await;

        for _ in 0..2 {
            let id = FileId::generate();
            let mut file = cache.begin_upload(&id).await.unwrap();
            file.write_all(&[0u8; 400]).await.unwrap();
            drop(file);
            cache.commit_upload(&id).await.unwrap();
        }
        cache.drain_once().await;

        let evicted = cache.evict_once().await.unwrap();
        assert!(evicted >= 1);
    }
}

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncReadExt;

use super::cache::{CacheError, CiphertextCache};
use super::FileId;

const LOCAL_READ_CHUNK: usize = 64 * 1024;

enum Source {
    /// A local `.cached` or `.uploaded` file
    Local(tokio::fs::File),
    /// A streaming response from a peer replica
    Peer(reqwest::Response),
    /// One chunk range-requested out of permanent storage
    Storage { buffer: Vec<u8>, position: usize },
}

/// A virtual reader that makes range-requested chunks look like one
/// contiguous ciphertext stream.
///
/// Each refill prefers the local copy (so a finished background recache gets
/// picked up mid-stream), then a peer if one previously served bytes or no
/// durable storage exists, then a chunk range request against durable
/// storage. Chunking the durable pulls bounds memory held per request.
pub struct Puller {
    cache: Arc<CiphertextCache>,
    id: FileId,
    total_length: u64,
    index: u64,
    source: Option<Source>,
    is_p2p: bool,
    pub is_local: bool,
}

impl Puller {
    /// Prepare to pull ciphertext beginning at `cipher_start`. Fails only
    /// when no source can produce bytes.
    pub async fn new(
        cache: Arc<CiphertextCache>,
        id: FileId,
        total_length: u64,
        cipher_start: u64,
    ) -> Result<Self, CacheError> {
        let mut puller = Puller {
            cache,
            id,
            total_length,
            index: cipher_start,
            source: None,
            is_p2p: false,
            is_local: false,
        };
        if puller.index < puller.total_length {
            puller.refill().await?;
        }
        Ok(puller)
    }

    async fn refill(&mut self) -> Result<(), CacheError> {
        // Always check disk first; a background recache may have landed
        if let Some(file) = self.cache.open_local(&self.id, self.index).await? {
            self.is_local = true;
            self.source = Some(Source::Local(file));
            return Ok(());
        }
        self.is_local = false;

        let no_storage = self.cache.permanent().is_none();
        if self.is_p2p || no_storage {
            if let Some(peers) = self.cache.peer_fetcher().filter(|p| p.enabled()) {
                match peers.fetch(self.cache.zone(), &self.id, self.index).await {
                    Ok(response) => {
                        // Once a chunk came from a peer, keep using peers for
                        // the rest of this pull
                        self.is_p2p = true;
                        self.source = Some(Source::Peer(response));
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::info!(id = %self.id, error = %e, "puller cannot use peers");
                    }
                }
            }
            if no_storage {
                return Err(CacheError::NotFound);
            }
        }

        let permanent = self.cache.permanent().expect("permanent storage present");
        let end = (self.index + self.cache.chunk_size - 1).min(self.total_length - 1);
        let key = format!("{}/{}", self.cache.zone(), self.id);
        tracing::debug!(key = %key, begin = self.index, end, "puller range requesting permanent storage");
        match permanent.download_range(&key, self.index, Some(end)).await {
            Ok(buffer) => {
                self.source = Some(Source::Storage {
                    buffer,
                    position: 0,
                });
                Ok(())
            }
            Err(e) => {
                // The blob may only exist on the node that took the upload;
                // try the peers once before giving up.
                if let Some(peers) = self.cache.peer_fetcher().filter(|p| p.enabled()) {
                    if let Ok(response) =
                        peers.fetch(self.cache.zone(), &self.id, self.index).await
                    {
                        self.is_p2p = true;
                        self.source = Some(Source::Peer(response));
                        return Ok(());
                    }
                }
                Err(e.into())
            }
        }
    }

    /// The next chunk of ciphertext, or `None` at the end of the stream
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, io::Error> {
        loop {
            if self.index >= self.total_length {
                return Ok(None);
            }
            let produced: Option<Bytes> = match self.source.as_mut() {
                None => None,
                Some(Source::Local(file)) => {
                    let mut buffer = vec![0u8; LOCAL_READ_CHUNK];
                    let n = file.read(&mut buffer).await?;
                    if n == 0 {
                        None
                    } else {
                        buffer.truncate(n);
                        Some(Bytes::from(buffer))
                    }
                }
                Some(Source::Peer(response)) => response
                    .chunk()
                    .await
                    .map_err(|e| io::Error::other(format!("peer stream failed: {}", e)))?,
                Some(Source::Storage { buffer, position }) => {
                    if *position >= buffer.len() {
                        None
                    } else {
                        let end = (*position + LOCAL_READ_CHUNK).min(buffer.len());
                        let chunk = Bytes::copy_from_slice(&buffer[*position..end]);
                        *position = end;
                        Some(chunk)
                    }
                }
            };
            match produced {
                Some(chunk) => {
                    self.index += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                None => {
                    // Source exhausted before the stream is complete
                    self.source = None;
                    self.refill()
                        .await
                        .map_err(|e| io::Error::other(e.to_string()))?;
                }
            }
        }
    }

    /// Adapt the puller into a byte stream for a response body
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> {
        futures::stream::try_unfold(self, |mut puller| async move {
            match puller.next_chunk().await? {
                Some(chunk) => Ok(Some((chunk, puller))),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ciphertext::{FileStorage, PermanentStorage, Zone};
    use crate::service_config::DiskCacheConfig;
    use common::crypto::MasterKey;
    use tokio::io::AsyncWriteExt;

    async fn staged_cache(
        data: &[u8],
    ) -> (Arc<CiphertextCache>, FileId, tempfile::TempDir, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(store_dir.path()));
        let config = DiskCacheConfig {
            root: dir.path().to_path_buf(),
            chunk_size_mb: 1,
            ..Default::default()
        };
        let cache = CiphertextCache::open(
            Zone::new("default"),
            &config,
            Some(storage),
            None,
            &MasterKey::new("puller test key").unwrap(),
        )
        .await
        .unwrap();

        let id = FileId::generate();
        let mut file = cache.begin_upload(&id).await.unwrap();
        file.write_all(data).await.unwrap();
        drop(file);
        cache.commit_upload(&id).await.unwrap();
        cache.drain_once().await;
        (cache, id, dir, store_dir)
    }

    async fn read_all(mut puller: Puller) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = puller.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_pull_from_local() {
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let (cache, id, _a, _b) = staged_cache(&data).await;
        let puller = Puller::new(cache, id, data.len() as u64, 0).await.unwrap();
        assert!(puller.is_local);
        assert_eq!(read_all(puller).await, data);
    }

    #[tokio::test]
    async fn test_pull_from_storage_after_eviction() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (cache, id, _a, _b) = staged_cache(&data).await;
        tokio::fs::remove_file(
            cache.path(&id, crate::ciphertext::FileState::Cached),
        )
        .await
        .unwrap();

        let puller = Puller::new(Arc::clone(&cache), id, data.len() as u64, 0)
            .await
            .unwrap();
        assert!(!puller.is_local);
        assert_eq!(read_all(puller).await, data);
    }

    #[tokio::test]
    async fn test_pull_range_offset() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 127) as u8).collect();
        let (cache, id, _a, _b) = staged_cache(&data).await;
        let puller = Puller::new(cache, id, data.len() as u64, 4096).await.unwrap();
        assert_eq!(read_all(puller).await, &data[4096..]);
    }
}

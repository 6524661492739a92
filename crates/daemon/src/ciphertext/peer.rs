use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use super::{FileId, Zone};

/// Errors raised while fetching ciphertext from peer replicas
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no peer has the ciphertext")]
    NotPresent,
    #[error("peer fetch disabled")]
    Disabled,
}

/// Fetches ciphertext ranges from peer replicas when durable storage is
/// unavailable or still catching up with a fresh upload.
///
/// The peer set is published as an atomic snapshot; readers see one
/// consistent list per request. Peers are tried in random order to spread
/// load; a `204 No Content` means "not present here" and the next peer is
/// tried.
pub struct PeerFetcher {
    client: reqwest::Client,
    peers: RwLock<Arc<Vec<String>>>,
    signifier: String,
    enabled: bool,
}

impl PeerFetcher {
    pub fn new(peers: Vec<String>, signifier: impl Into<String>, enabled: bool) -> Self {
        PeerFetcher {
            client: reqwest::Client::new(),
            peers: RwLock::new(Arc::new(peers)),
            signifier: signifier.into(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled && !self.peers.read().is_empty()
    }

    /// Replace the peer set with a new snapshot
    pub fn set_peers(&self, peers: Vec<String>) {
        *self.peers.write() = Arc::new(peers);
    }

    pub fn peers(&self) -> Arc<Vec<String>> {
        self.peers.read().clone()
    }

    /// Try each peer for the blob, starting at `offset`. Returns the first
    /// streaming response carrying bytes.
    pub async fn fetch(
        &self,
        zone: &Zone,
        id: &FileId,
        offset: u64,
    ) -> Result<reqwest::Response, PeerError> {
        if !self.enabled() {
            return Err(PeerError::Disabled);
        }
        let mut peers: Vec<String> = self.peers().as_ref().clone();
        peers.shuffle(&mut rand::rng());

        for peer in peers {
            let url = format!(
                "{}/ciphertext/{}/{}",
                peer.trim_end_matches('/'),
                zone,
                id
            );
            let request = self
                .client
                .get(&url)
                .header("USER_DN", &self.signifier)
                .header("SSL_CLIENT_S_DN", &self.signifier)
                .header("Range", format!("bytes={}-", offset));
            match request.send().await {
                Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {
                    tracing::debug!(peer = %peer, id = %id, "peer does not have ciphertext");
                }
                Ok(response) if response.status().is_success() => {
                    tracing::info!(peer = %peer, id = %id, offset, "fetching ciphertext from peer");
                    return Ok(response);
                }
                Ok(response) => {
                    tracing::info!(
                        peer = %peer,
                        id = %id,
                        status = %response.status(),
                        "peer refused ciphertext fetch"
                    );
                }
                Err(e) => {
                    tracing::info!(peer = %peer, id = %id, error = %e, "peer unreachable");
                }
            }
        }
        Err(PeerError::NotPresent)
    }
}

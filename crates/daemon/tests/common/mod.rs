//! Shared test harness: the full router over the in-memory object store,
//! the in-memory authorization service, and a temp-dir ciphertext cache.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{Request, Response};
use tempfile::TempDir;
use tower::ServiceExt;

use ::common::auth::FakeAccessControl;
use ::common::crypto::MasterKey;
use coffer_daemon::ciphertext::{
    CiphertextCache, FileStorage, PeerFetcher, PermanentStorage, Zone,
};
use coffer_daemon::database::MemoryObjectStore;
use coffer_daemon::events::NoopBus;
use coffer_daemon::http_server;
use coffer_daemon::{Config, ServiceState};

/// Default caller for requests sent through the harness
pub const TESTER: &str = "cn=test tester10,ou=people,o=u.s. government";

pub const MASTER_KEY: &str = "integration master key";

pub struct TestService {
    pub state: ServiceState,
    pub access: Arc<FakeAccessControl>,
    pub router: Router,
    cache_dir: TempDir,
    _storage_dir: Option<TempDir>,
}

pub async fn setup_test_service() -> TestService {
    setup(Vec::new(), false).await
}

/// Service with filesystem-backed durable storage, so drains and faults
/// from the permanent tier can be exercised.
pub async fn setup_with_storage() -> TestService {
    setup(Vec::new(), true).await
}

/// Service whose cache falls back to the given peer base URLs
pub async fn setup_with_peers(peer_urls: Vec<String>) -> TestService {
    setup(peer_urls, false).await
}

async fn setup(peer_urls: Vec<String>, durable: bool) -> TestService {
    let cache_dir = TempDir::new().unwrap();
    let mut config = Config {
        master_key: MASTER_KEY.to_string(),
        ..Default::default()
    };
    config.cache.root = cache_dir.path().to_path_buf();
    config.peers.enabled = !peer_urls.is_empty();
    config.peers.urls = peer_urls.clone();

    let master = MasterKey::new(MASTER_KEY).unwrap();
    let peers = if peer_urls.is_empty() {
        None
    } else {
        Some(Arc::new(PeerFetcher::new(
            peer_urls,
            config.peers.signifier.clone(),
            true,
        )))
    };
    let (storage_dir, storage): (Option<TempDir>, Option<Arc<dyn PermanentStorage>>) =
        if durable {
            let dir = TempDir::new().unwrap();
            let storage: Arc<dyn PermanentStorage> = Arc::new(FileStorage::new(dir.path()));
            (Some(dir), Some(storage))
        } else {
            (None, None)
        };
    let cache = CiphertextCache::open(
        Zone::new(config.cache.zone.clone()),
        &config.cache,
        storage,
        peers,
        &master,
    )
    .await
    .unwrap();

    let access = Arc::new(FakeAccessControl::new());
    let state = ServiceState::new(
        config,
        Arc::new(MemoryObjectStore::new()),
        access.clone(),
        Arc::new(NoopBus),
        cache,
        master,
    );
    let router = http_server::router(state.clone());
    TestService {
        state,
        access,
        router,
        cache_dir,
        _storage_dir: storage_dir,
    }
}

impl TestService {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Remove every locally cached blob, forcing reads to fault from
    /// durable storage or a peer.
    pub fn evict_all_local(&self) {
        let zone = self.state.config().cache.zone.clone();
        let dir = self.cache_dir.path().join(zone);
        for entry in std::fs::read_dir(dir).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("canary") {
                continue;
            }
            if name.ends_with(".cached") || name.ends_with(".uploaded") {
                std::fs::remove_file(entry.path()).unwrap();
            }
        }
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.get_as(TESTER, path).await
    }

    pub async fn get_as(&self, dn: &str, path: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .method("GET")
                .uri(path)
                .header("SSL_CLIENT_S_DN", dn)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn get_with_headers(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        let mut request = Request::builder()
            .method("GET")
            .uri(path)
            .header("SSL_CLIENT_S_DN", TESTER);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> Response<Body> {
        self.post_json_as(TESTER, path, body).await
    }

    pub async fn post_json_as(
        &self,
        dn: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Response<Body> {
        self.send(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("SSL_CLIENT_S_DN", dn)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn delete_json(&self, path: &str, body: serde_json::Value) -> Response<Body> {
        self.send(
            Request::builder()
                .method("DELETE")
                .uri(path)
                .header("SSL_CLIENT_S_DN", TESTER)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Create an object through the API and return the response body
    pub async fn create_object(&self, body: serde_json::Value) -> serde_json::Value {
        let response = self.post_json("/objects", body).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        body_json(response).await
    }

    /// Upload an object with content through the multipart path
    pub async fn upload_object(
        &self,
        metadata: serde_json::Value,
        file_name: &str,
        content: &[u8],
    ) -> serde_json::Value {
        let (content_type, body) = multipart_body(&metadata, file_name, content);
        let response = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/objects")
                    .header("SSL_CLIENT_S_DN", TESTER)
                    .header("Content-Type", content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        body_json(response).await
    }
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap()
}

pub fn unclassified() -> serde_json::Value {
    serde_json::json!({ "classif": "U" })
}

/// Metadata plus a binary content part, in the order the create handler
/// requires.
pub fn multipart_body(
    metadata: &serde_json::Value,
    file_name: &str,
    content: &[u8],
) -> (String, Vec<u8>) {
    let boundary = "testboundary7MA4YWxkTrZu0gW";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"ObjectMetadata\"\r\n\r\n",
    );
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"filestream\"; filename=\"{}\"\r\n",
            file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (
        format!("multipart/form-data; boundary={}", boundary),
        body,
    )
}

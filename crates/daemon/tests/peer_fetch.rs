//! Peer-to-peer ciphertext fetch: route restriction to the peer signifier
//! and faulting content from the node that still holds the local copy.

mod common;

use http::StatusCode;

use ::common::models::ObjectId;
use common::{body_bytes, setup_test_service, setup_with_peers, unclassified, TESTER};

#[tokio::test]
async fn test_ciphertext_route_is_peer_only() {
    let service = setup_test_service().await;
    let file_id = "ab".repeat(32);

    let response = service
        .get_as(TESTER, &format!("/ciphertext/default/{}", file_id))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The peer signifier reaches the route; the blob simply is not here
    let signifier = service.state.peer_signifier().to_string();
    let response = service
        .get_as(&signifier, &format!("/ciphertext/default/{}", file_id))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Anything but a well-formed file id is rejected before disk access
    let response = service
        .get_as(&signifier, "/ciphertext/default/not-a-file-id")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_faults_content_from_a_peer() {
    // Node A takes the upload and serves ciphertext over a real listener
    let node_a = setup_with_peers(Vec::new()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router_a = node_a.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router_a).await.unwrap();
    });

    let data: Vec<u8> = (0..60_000).map(|i| (i % 239) as u8).collect();
    let created = node_a
        .upload_object(
            serde_json::json!({ "name": "replicated.bin", "acm": unclassified() }),
            "replicated.bin",
            &data,
        )
        .await;
    let id = created["id"].as_str().unwrap();

    // Node B knows the metadata but holds no ciphertext and has no durable
    // storage; node A is its only source.
    let node_b = setup_with_peers(vec![format!("http://{}", addr)]).await;
    let object = node_a
        .state
        .store()
        .get_object(ObjectId::from_hex(id).unwrap())
        .await
        .unwrap();
    node_b.state.store().create_object(object).await.unwrap();

    let response = node_b.get(&format!("/objects/{}/stream", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), &data[..]);

    // Range reads ride the same path
    let response = node_b
        .get_with_headers(
            &format!("/objects/{}/stream", id),
            &[("Range", "bytes=1000-2999")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await.as_ref(), &data[1_000..3_000]);
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    // Peers configured but nobody has the blob and there is no durable
    // storage
    let node_a = setup_test_service().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router_a = node_a.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router_a).await.unwrap();
    });

    let node_b = setup_with_peers(vec![format!("http://{}", addr)]).await;
    let data: Vec<u8> = vec![7u8; 4_096];
    let created = node_b
        .upload_object(
            serde_json::json!({ "name": "lost.bin", "acm": unclassified() }),
            "lost.bin",
            &data,
        )
        .await;
    let id = created["id"].as_str().unwrap();
    node_b.evict_all_local();

    let response = node_b.get(&format!("/objects/{}/stream", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

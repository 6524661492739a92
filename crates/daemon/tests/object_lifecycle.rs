//! End-to-end lifecycle of an object: create, list, update, trash,
//! restore, expunge, and the precondition/lifecycle failures along the way.

mod common;

use http::StatusCode;

use common::{body_json, setup_test_service, unclassified, TESTER};

#[tokio::test]
async fn test_create_list_update_trash_untrash_expunge() {
    let service = setup_test_service().await;

    let created = service
        .create_object(serde_json::json!({
            "name": "F",
            "typeName": "Folder",
            "acm": unclassified(),
        }))
        .await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 32);
    assert_eq!(created["parentId"], "");
    assert_eq!(created["changeCount"], 0);
    let token = created["changeToken"].as_str().unwrap().to_string();

    // The new object shows up at the caller's root
    let listing = body_json(service.get("/objects").await).await;
    let roots: Vec<&str> = listing["objects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_str().unwrap())
        .collect();
    assert!(roots.contains(&id.as_str()));

    // Rename bumps the change count and rotates the token
    let updated = body_json(
        service
            .post_json(
                &format!("/objects/{}/properties", id),
                serde_json::json!({ "changeToken": token, "name": "F2" }),
            )
            .await,
    )
    .await;
    assert_eq!(updated["name"], "F2");
    assert_eq!(updated["changeCount"], 1);
    let token = updated["changeToken"].as_str().unwrap().to_string();
    assert_ne!(token, created["changeToken"].as_str().unwrap());

    // Trash, restore, expunge
    let trashed = body_json(
        service
            .post_json(
                &format!("/objects/{}/trash", id),
                serde_json::json!({ "changeToken": token }),
            )
            .await,
    )
    .await;
    assert_eq!(trashed["isDeleted"], true);
    let token = trashed["changeToken"].as_str().unwrap().to_string();

    let restored = body_json(
        service
            .post_json(
                &format!("/objects/{}/untrash", id),
                serde_json::json!({ "changeToken": token }),
            )
            .await,
    )
    .await;
    assert_eq!(restored["isDeleted"], false);
    let token = restored["changeToken"].as_str().unwrap().to_string();

    let expunged = body_json(
        service
            .delete_json(
                &format!("/objects/{}", id),
                serde_json::json!({ "changeToken": token }),
            )
            .await,
    )
    .await;
    assert_eq!(expunged["isExpunged"], true);

    // Gone means gone
    let response = service.get(&format!("/objects/{}/properties", id)).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_stale_change_token_is_a_precondition_failure() {
    let service = setup_test_service().await;
    let created = service
        .create_object(serde_json::json!({
            "name": "doc",
            "acm": unclassified(),
        }))
        .await;
    let id = created["id"].as_str().unwrap();

    let response = service
        .post_json(
            &format!("/objects/{}/properties", id),
            serde_json::json!({ "changeToken": "stale", "name": "renamed" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_REQUIRED);

    // A missing token fails the same way
    let response = service
        .post_json(
            &format!("/objects/{}/properties", id),
            serde_json::json!({ "name": "renamed" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_REQUIRED);
}

#[tokio::test]
async fn test_trashed_object_cannot_be_updated() {
    let service = setup_test_service().await;
    let created = service
        .create_object(serde_json::json!({ "name": "doc", "acm": unclassified() }))
        .await;
    let id = created["id"].as_str().unwrap();
    let token = created["changeToken"].as_str().unwrap();

    let trashed = body_json(
        service
            .post_json(
                &format!("/objects/{}/trash", id),
                serde_json::json!({ "changeToken": token }),
            )
            .await,
    )
    .await;

    let response = service
        .post_json(
            &format!("/objects/{}/properties", id),
            serde_json::json!({
                "changeToken": trashed["changeToken"],
                "name": "renamed",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Reading properties of a trashed object yields the reduced projection
    let projection = body_json(service.get(&format!("/objects/{}/properties", id)).await).await;
    assert_eq!(projection["isDeleted"], true);
    assert!(projection.get("name").is_none());
}

#[tokio::test]
async fn test_malformed_and_unknown_ids() {
    let service = setup_test_service().await;

    let response = service.get("/objects/nothex/properties").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = service
        .get(&format!("/objects/{}/properties", "00".repeat(16)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_requires_acm() {
    let service = setup_test_service().await;
    let response = service
        .post_json("/objects", serde_json::json!({ "name": "no acm" }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_impersonation_needs_whitelisted_system() {
    let service = setup_test_service().await;
    // USER_DN plus a certificate DN that is not whitelisted
    let response = service
        .send(
            http::Request::builder()
                .method("GET")
                .uri("/objects")
                .header("USER_DN", TESTER)
                .header("SSL_CLIENT_S_DN", "cn=unknown proxy,ou=services")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cors_preflight_allows_default_headers() {
    let service = setup_test_service().await;
    let response = service
        .send(
            http::Request::builder()
                .method("OPTIONS")
                .uri("/objects")
                .header("Origin", "https://drive-ui.example")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Access-Control-Allow-Origin").unwrap(),
        "https://drive-ui.example"
    );
    // No Access-Control-Request-Headers named; a default set is allowed
    assert_eq!(
        response.headers().get("Access-Control-Allow-Headers").unwrap(),
        "content-type, x-requested-with"
    );
    assert_eq!(response.headers().get("Vary").unwrap(), "Origin");

    // Plain requests get the origin reflected as well
    let response = service
        .get_with_headers("/ping", &[("Origin", "https://drive-ui.example")])
        .await;
    assert_eq!(
        response.headers().get("Access-Control-Allow-Origin").unwrap(),
        "https://drive-ui.example"
    );
}

#[tokio::test]
async fn test_every_response_carries_a_session_id() {
    let service = setup_test_service().await;
    let response = service.get("/ping").await;
    assert!(response.headers().contains_key("sessionid"));
}

#[tokio::test]
async fn test_reserved_endpoints_are_not_implemented() {
    let service = setup_test_service().await;
    for path in ["/favorites", "/subscriptions", "/relationships"] {
        let response = service.get(path).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED, "{}", path);
    }
}

#[tokio::test]
async fn test_move_rejects_cycles() {
    let service = setup_test_service().await;
    let parent = service
        .create_object(serde_json::json!({
            "name": "top",
            "typeName": "Folder",
            "acm": unclassified(),
        }))
        .await;
    let child = service
        .create_object(serde_json::json!({
            "name": "middle",
            "typeName": "Folder",
            "parentId": parent["id"],
            "acm": unclassified(),
        }))
        .await;

    // Moving the parent under its own child would orphan the subtree
    let response = service
        .post_json(
            &format!(
                "/objects/{}/move/{}",
                parent["id"].as_str().unwrap(),
                child["id"].as_str().unwrap()
            ),
            serde_json::json!({ "changeToken": parent["changeToken"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Moving the child to the root is fine
    let response = service
        .post_json(
            &format!("/objects/{}/move", child["id"].as_str().unwrap()),
            serde_json::json!({ "changeToken": child["changeToken"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let moved = body_json(response).await;
    assert_eq!(moved["parentId"], "");
}

#[tokio::test]
async fn test_path_delimited_names_create_folders() {
    let service = setup_test_service().await;
    let leaf = service
        .create_object(serde_json::json!({
            "name": "reports/2024/summary.txt",
            "acm": unclassified(),
        }))
        .await;
    assert_eq!(leaf["name"], "summary.txt");
    let parent_id = leaf["parentId"].as_str().unwrap();
    assert!(!parent_id.is_empty());

    let year = body_json(service.get(&format!("/objects/{}/properties", parent_id)).await).await;
    assert_eq!(year["name"], "2024");
    assert_eq!(year["typeName"], "Folder");

    let reports_id = year["parentId"].as_str().unwrap();
    let reports = body_json(
        service
            .get(&format!("/objects/{}/properties", reports_id))
            .await,
    )
    .await;
    assert_eq!(reports["name"], "reports");
    assert_eq!(reports["parentId"], "");

    // Re-using the prefix finds the existing folders instead of duplicating
    let second = service
        .create_object(serde_json::json!({
            "name": "reports/2024/details.txt",
            "acm": unclassified(),
        }))
        .await;
    assert_eq!(second["parentId"], leaf["parentId"]);
}

#[tokio::test]
async fn test_bulk_delete_reports_per_object_results() {
    let service = setup_test_service().await;
    let a = service
        .create_object(serde_json::json!({ "name": "a", "acm": unclassified() }))
        .await;
    let missing = "11".repeat(16);

    let response = service
        .delete_json(
            "/objects",
            serde_json::json!([
                { "objectId": a["id"], "changeToken": a["changeToken"] },
                { "objectId": missing, "changeToken": "whatever" },
            ]),
        )
        .await;
    // Bulk responses are 200 even when individual operations fail
    assert_eq!(response.status(), StatusCode::OK);
    let results = body_json(response).await;
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["code"], 200);
    assert_eq!(results[1]["code"], 404);

    let gone = service
        .get(&format!("/objects/{}/properties", a["id"].as_str().unwrap()))
        .await;
    let projection = body_json(gone).await;
    assert_eq!(projection["isDeleted"], true);
}

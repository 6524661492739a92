use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use http::header::{HeaderValue, ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY};
use http::{Method, StatusCode};
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;

pub mod api;
pub mod context;
pub mod error;

pub use error::AppError;

use crate::service_config::MAX_UPLOAD_SIZE_BYTES;
use crate::state::ServiceState;

/// Random opaque id attached to every request and echoed in the `sessionid`
/// response header.
#[derive(Debug, Clone)]
pub struct SessionId(pub String);

async fn session(mut request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().simple().to_string();
    request.extensions_mut().insert(SessionId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("sessionid", value);
    }
    response
}

const DEFAULT_ALLOWED_HEADERS: &str = "content-type, x-requested-with";

/// Reflect the Origin back on every response and answer preflights. When a
/// preflight names no request headers, a default set is allowed.
async fn cors(request: Request, next: Next) -> Response {
    let origin = request.headers().get(ORIGIN).cloned();
    if request.method() == Method::OPTIONS {
        if let Some(origin) = origin {
            let allow_headers = request
                .headers()
                .get(ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS));
            let mut response = Response::new(Body::empty());
            let headers = response.headers_mut();
            headers.insert("Access-Control-Allow-Origin", origin);
            headers.insert("Access-Control-Allow-Headers", allow_headers);
            headers.insert(
                "Access-Control-Allow-Methods",
                HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
            );
            headers.insert(VARY, HeaderValue::from_static("Origin"));
            return response;
        }
    }
    let mut response = next.run(request).await;
    if let Some(origin) = origin {
        response
            .headers_mut()
            .insert("Access-Control-Allow-Origin", origin);
        response
            .headers_mut()
            .insert(VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// A panic in any handler is caught here, logged with its payload, and
/// rendered as a 500.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> http::Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "handler panicked");
    http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::from("Internal Server Error"))
        .expect("static response builds")
}

async fn not_implemented() -> AppError {
    AppError::not_implemented("This endpoint is reserved and not implemented")
}

/// Assemble the full application router under the configured base prefix
pub fn router(state: ServiceState) -> Router {
    // Routes that bypass user lookup: diagnostics and the peer ciphertext
    // fetch (which validates the peer signifier itself).
    let open_routes = Router::new()
        .route("/ping", get(api::diagnostics::ping))
        .route("/stats", get(api::diagnostics::stats))
        .route(
            "/ciphertext/:zone/:file_id",
            get(api::ciphertext::get_ciphertext),
        )
        .with_state(state.clone());

    let user_routes = Router::new()
        .route(
            "/objects",
            get(api::objects::list::list_roots)
                .post(api::objects::create::create_object)
                .delete(api::objects::bulk::bulk_delete),
        )
        .route("/objects/properties", post(api::objects::bulk::bulk_properties))
        .route("/objects/move", post(api::objects::bulk::bulk_move))
        .route(
            "/objects/owner/*new_owner",
            post(api::objects::bulk::bulk_change_owner),
        )
        .route(
            "/objects/:id",
            get(api::objects::list::list_children).delete(api::objects::trash::expunge_object),
        )
        .route(
            "/objects/:id/properties",
            get(api::objects::get::get_properties).post(api::objects::update::update_properties),
        )
        .route(
            "/objects/:id/stream",
            get(api::objects::stream::get_stream)
                .post(api::objects::update_stream::update_stream),
        )
        .route("/objects/:id/trash", post(api::objects::trash::trash_object))
        .route(
            "/objects/:id/untrash",
            post(api::objects::trash::untrash_object),
        )
        .route("/objects/:id/move", post(api::objects::move_::move_object))
        .route(
            "/objects/:id/move/:folder",
            post(api::objects::move_::move_object_to_folder),
        )
        .route(
            "/objects/:id/owner/*new_owner",
            post(api::objects::owner::change_owner),
        )
        .route("/revisions/:id", get(api::objects::revisions::list_revisions))
        .route(
            "/revisions/:id/:rev/stream",
            get(api::objects::revisions::revision_stream),
        )
        .route("/shares", get(api::objects::shares::shared_to_me))
        .route("/shared", get(api::objects::shares::shared_by_me))
        .route(
            "/shared/:id",
            post(api::objects::shares::grant_share)
                .delete(api::objects::shares::revoke_share),
        )
        .route(
            "/sharedpublic",
            get(api::objects::shares::shared_to_everyone),
        )
        .route(
            "/trashed",
            get(api::objects::trash::list_trashed).delete(api::objects::trash::empty_trash),
        )
        .route("/search/:phrase", get(api::objects::search::search_objects))
        .route(
            "/groupobjects/*group",
            get(api::objects::list::list_group_objects),
        )
        .route("/userstats", get(api::diagnostics::user_stats))
        .route("/favorites", get(not_implemented).post(not_implemented))
        .route(
            "/subscriptions",
            get(not_implemented).post(not_implemented),
        )
        .route(
            "/relationships",
            get(not_implemented).post(not_implemented),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            context::require_context,
        ))
        .with_state(state.clone());

    let app = Router::new().merge(open_routes).merge(user_routes);

    let prefix = state.config().http.base_prefix.clone();
    let app = if prefix != "/" && !prefix.is_empty() {
        Router::new().nest(&prefix, app)
    } else {
        app
    };

    app.layer(middleware::from_fn(cors))
        .layer(middleware::from_fn(session))
        .layer(CatchPanicLayer::custom(
            handle_panic as fn(Box<dyn std::any::Any + Send + 'static>) -> http::Response<Body>,
        ))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE_BYTES))
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}

/// Run the HTTP server until the shutdown signal fires
pub async fn run(
    state: ServiceState,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let listen_addr = state.config().http.listen_addr;
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    let app = router(state).layer(trace_layer);

    tracing::info!(addr = ?listen_addr, "object drive listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

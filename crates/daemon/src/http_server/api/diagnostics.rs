use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn ping() -> impl IntoResponse {
    Json(PingResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StatsQuery {
    verbose: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    zone: String,
    uploaded_pending_drain: usize,
    cache_inventory: Vec<String>,
}

/// Cache inventory and drain backlog; uploaded files always listed, the
/// full inventory with `?verbose=true`.
pub async fn stats(
    State(state): State<ServiceState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let cache = state.cache();
    Json(StatsResponse {
        zone: cache.zone().to_string(),
        uploaded_pending_drain: cache.count_uploaded().await,
        cache_inventory: cache.inventory(query.verbose).await,
    })
}

pub async fn user_stats(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .store()
        .user_stats(ctx.dn())
        .await
        .map_err(|e| AppError::from_store(e, "unable to compute user stats"))?;
    Ok(Json(stats))
}

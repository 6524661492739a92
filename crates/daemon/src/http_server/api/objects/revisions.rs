use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use http::HeaderMap;
use serde::Serialize;

use common::models::Revision;

use crate::database::PagedResults;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::stream::{stream_response, ContentMeta, StreamQuery};
use super::{fetch_object, parse_object_id, require_caps, Caps};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionView {
    pub object_id: String,
    pub change_count: i64,
    pub name: String,
    pub description: String,
    pub content_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub modified_date: chrono::DateTime<chrono::Utc>,
    pub modified_by: String,
}

impl RevisionView {
    fn of(revision: &Revision) -> Self {
        RevisionView {
            object_id: revision.object_id.to_hex(),
            change_count: revision.change_count,
            name: revision.name.clone(),
            description: revision.description.clone(),
            content_size: revision.content_size,
            content_type: revision.content_type.clone(),
            modified_date: revision.modified_date,
            modified_by: revision.modified_by.clone(),
        }
    }
}

/// List the revision history of an object the caller can read
pub async fn list_revisions(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(paging): Query<super::PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let object = fetch_object(&state, id).await?;
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    require_caps(&state, &ctx, &object, Caps::read_only(), "read this object")?;
    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    let page = state
        .store()
        .get_revisions(id, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list revisions"))?;
    let results = PagedResults {
        total_rows: page.total_rows,
        page_count: page.page_count,
        page_number: page.page_number,
        page_size: page.page_size,
        objects: page.objects.iter().map(RevisionView::of).collect(),
    };
    Ok(Json(results))
}

/// Read the content of a specific revision. Authorization runs against the
/// revision's own ACM; the file key comes from the caller's current grant.
pub async fn revision_stream(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, rev)): Path<(String, i64)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_object_id(&id)?;
    let object = fetch_object(&state, id).await?;
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    let permission = require_caps(
        &state,
        &ctx,
        &object,
        Caps::read_only(),
        "read this object",
    )?;
    let file_key = permission.file_key(state.master()).map_err(|e| {
        AppError::with_cause(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to derive file key from permission",
            e,
        )
    })?;

    let revision = state
        .store()
        .get_revision(id, rev)
        .await
        .map_err(|e| AppError::from_store(e, "unable to load revision"))?;

    state
        .access()
        .check_access(ctx.dn(), &revision.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    let meta = ContentMeta {
        connector: revision.content_connector.clone().unwrap_or_default(),
        size: revision.content_size,
        hash: revision.content_hash.clone(),
        iv: revision.encrypt_iv.unwrap_or_default(),
        content_type: revision.content_type.clone(),
        name: revision.name.clone(),
        description: revision.description.clone(),
        banner: revision.raw_acm.banner(),
    };
    stream_response(&state, meta, file_key, &headers, query.disposition).await
}

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};

use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::list::paged_views;
use super::PagingQuery;

/// Name and description substring search over objects the caller can read
pub async fn search_objects(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(phrase): Path<String>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let phrase = phrase.trim().to_string();
    if phrase.is_empty() {
        return Err(AppError::bad_request("A search phrase is required"));
    }
    let page = state
        .store()
        .search(&phrase, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to search"))?;

    // Search must not leak names the caller cannot read: keep only entries
    // whose ACM passes and where the caller holds a read grant.
    let readable = {
        let mut kept = Vec::with_capacity(page.objects.len());
        for object in page.objects {
            let (ok, _) = common::permissions::rollup(
                state.master(),
                ctx.dn(),
                &ctx.groups,
                &object.permissions,
                common::permissions::Caps::read_only(),
            );
            if ok {
                kept.push(object);
            }
        }
        crate::database::PagedResults {
            total_rows: page.total_rows,
            page_count: page.page_count,
            page_number: page.page_number,
            page_size: page.page_size,
            objects: kept,
        }
    };
    Ok(Json(paged_views(&state, &ctx, readable).await))
}

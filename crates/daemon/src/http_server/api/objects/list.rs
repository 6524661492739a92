use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};

use common::models::{flatten, Resource};

use crate::database::PagedResults;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::{
    breadcrumbs_for, fetch_object, filter_authorized, parse_object_id, require_caps,
    require_reachable, Caps, ObjectView, PagingQuery,
};

/// List the caller's root objects
pub async fn list_roots(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let owner = format!("user/{}", ctx.dn());
    let page = state
        .store()
        .get_root_objects(&owner, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list root objects"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

/// List the children of an object the caller can read
pub async fn list_children(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let object = fetch_object(&state, id).await?;
    require_reachable(&object)?;
    if object.is_deleted {
        return Err(AppError::new(
            http::StatusCode::CONFLICT,
            "The object is in the trash; restore it before listing its children",
        ));
    }
    require_caps(&state, &ctx, &object, Caps::read_only(), "read this object")?;
    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    let page = state
        .store()
        .get_children(id, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list children"))?;
    let mut results = paged_views(&state, &ctx, page).await;

    // Breadcrumbs cover the listed container itself
    let crumbs = breadcrumbs_for(&state, &ctx, id).await;
    for view in results.objects.iter_mut() {
        view.breadcrumbs = crumbs.clone();
    }
    Ok(Json(results))
}

/// List root objects owned by a group the caller belongs to
pub async fn list_group_objects(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(group): Path<String>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let resource_string = if group.starts_with("group/") {
        group
    } else {
        format!("group/{}", group)
    };
    let resource = Resource::parse(&resource_string)
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Invalid group resource", e))?;
    let grantee = resource.grantee();
    if !ctx.groups.iter().any(|g| flatten(g) == flatten(&grantee)) {
        return Err(AppError::forbidden(
            "Forbidden - caller is not a member of the group",
        ));
    }
    let page = state
        .store()
        .get_root_objects_by_group(&grantee, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list group objects"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

/// Convert a page of model objects into wire views, dropping entries whose
/// ACM the caller cannot read.
pub(super) async fn paged_views(
    state: &ServiceState,
    ctx: &RequestContext,
    page: PagedResults<common::models::DriveObject>,
) -> PagedResults<ObjectView> {
    let visible = filter_authorized(state, ctx, page.objects).await;
    PagedResults {
        total_rows: page.total_rows,
        page_count: page.page_count,
        page_number: page.page_number,
        page_size: page.page_size,
        objects: visible.iter().map(ObjectView::of).collect(),
    }
}

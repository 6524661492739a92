use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::{
    breadcrumbs_for, fetch_object, parse_object_id, require_caps, Caps, ObjectView,
};

/// Read object metadata.
///
/// Trashed objects still answer, but with the reduced deleted-object
/// projection; expunged objects are gone.
pub async fn get_properties(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
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

    if object.is_deleted {
        return Ok(Json(object.deleted_view()).into_response());
    }

    let crumbs = breadcrumbs_for(&state, &ctx, id).await;
    Ok(Json(ObjectView::of(&object).with_breadcrumbs(crumbs)).into_response())
}

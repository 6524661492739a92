use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use common::models::ObjectId;

use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::list::paged_views;
use super::{fetch_object, parse_object_id, require_caps, Caps, ObjectView, PagingQuery};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeTokenBody {
    pub change_token: String,
}

fn check_token(expected: &str, provided: &str) -> Result<(), AppError> {
    if provided.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }
    if expected != provided {
        return Err(AppError::precondition(
            "The changeToken does not match the current object state",
        ));
    }
    Ok(())
}

/// Soft delete: the object moves to the caller's trash
pub(super) async fn trash_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    change_token: &str,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    if object.is_ancestor_deleted {
        return Err(AppError::method_not_allowed(
            "The object cannot be modified because an ancestor is deleted.",
        ));
    }
    require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            delete: true,
            ..Default::default()
        },
        "delete this object",
    )?;
    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;
    check_token(&object.change_token, change_token)?;

    let deleted = state
        .store()
        .delete_object(id)
        .await
        .map_err(|e| AppError::from_store(e, "unable to delete object"))?;
    Ok(ObjectView::of(&deleted))
}

pub(super) async fn untrash_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    change_token: &str,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    if object.is_ancestor_deleted {
        return Err(AppError::method_not_allowed(
            "The object cannot be restored while an ancestor is deleted.",
        ));
    }
    require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            delete: true,
            ..Default::default()
        },
        "restore this object",
    )?;
    check_token(&object.change_token, change_token)?;

    let restored = state
        .store()
        .undelete_object(id)
        .await
        .map_err(|e| AppError::from_store(e, "unable to restore object"))?;
    Ok(ObjectView::of(&restored))
}

/// Irreversible removal
pub(super) async fn expunge_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    change_token: &str,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            delete: true,
            ..Default::default()
        },
        "expunge this object",
    )?;
    check_token(&object.change_token, change_token)?;

    let expunged = state
        .store()
        .expunge_object(id)
        .await
        .map_err(|e| AppError::from_store(e, "unable to expunge object"))?;
    Ok(ObjectView::of(&expunged))
}

macro_rules! audited {
    ($state:expr, $ctx:expr, $action:expr, $id:expr, $result:expr) => {
        match $result {
            Ok(view) => {
                let mut event = $ctx.event.event($action, ActionResult::Success);
                event.action_target = Some($id.to_hex());
                event.resources = serde_json::to_value(&view).ok();
                $state.publish_event(event);
                Ok(Json(view))
            }
            Err(e) => {
                $state.audit(
                    &$ctx.event,
                    $action,
                    ActionResult::Failure,
                    Some($id.to_hex()),
                    vec![e.code.as_u16().to_string()],
                );
                Err(e)
            }
        }
    };
}

pub async fn trash_object(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let token = body.map(|Json(b)| b.change_token).unwrap_or_default();
    let result = trash_core(&state, &ctx, id, &token).await;
    audited!(state, ctx, "delete", id, result)
}

pub async fn untrash_object(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let token = body.map(|Json(b)| b.change_token).unwrap_or_default();
    let result = untrash_core(&state, &ctx, id, &token).await;
    audited!(state, ctx, "undelete", id, result)
}

pub async fn expunge_object(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let token = body.map(|Json(b)| b.change_token).unwrap_or_default();
    let result = expunge_core(&state, &ctx, id, &token).await;
    audited!(state, ctx, "expunge", id, result)
}

/// List the caller's trash
pub async fn list_trashed(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .store()
        .get_trashed_objects(ctx.dn(), paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list trash"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmptyTrashResponse {
    expunged_count: u64,
}

/// Expunge everything in the caller's trash, page by page
pub async fn empty_trash(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.store().empty_trash(ctx.dn(), 100).await;
    match result {
        Ok(count) => {
            state.audit(
                &ctx.event,
                "expunge",
                ActionResult::Success,
                None,
                vec![format!("{} objects", count)],
            );
            Ok(Json(EmptyTrashResponse {
                expunged_count: count,
            }))
        }
        Err(e) => {
            let err = AppError::from_store(e, "unable to empty trash");
            state.audit(
                &ctx.event,
                "expunge",
                ActionResult::Failure,
                None,
                vec![err.code.as_u16().to_string()],
            );
            Err(err)
        }
    }
}

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use common::acm::AcmDocument;
use common::models::{flatten, ObjectId, Permission, Resource};
use common::permissions::reduce_grants;

use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::list::paged_views;
use super::{
    apply_acm_pipeline, fetch_object, parse_object_id, require_caps, require_mutable,
    AcmRewrite, Caps, ObjectView, PagingQuery,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareRequest {
    pub change_token: String,
    /// ACM share fragment naming the grantees
    pub share: serde_json::Value,
    pub allow_create: bool,
    pub allow_read: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub allow_share: bool,
}

impl ShareRequest {
    /// The principals named by the share fragment
    fn resources(&self) -> Result<Vec<Resource>, AppError> {
        if self.share.is_null() {
            return Err(AppError::bad_request("A share fragment is required"));
        }
        let doc = AcmDocument::from_value(serde_json::json!({ "share": self.share }))
            .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Invalid share fragment", e))?;
        let resources = doc.share_resources();
        if resources.is_empty() {
            return Err(AppError::bad_request(
                "The share fragment names no users or groups",
            ));
        }
        Ok(resources)
    }
}

/// Grant capabilities to the principals named in the share fragment.
/// Redundant grants (nothing beyond what the grantee already holds) are
/// dropped rather than duplicated.
pub async fn grant_share(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<ShareRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    match grant_share_core(&state, &ctx, id, &body).await {
        Ok(view) => {
            let mut event = ctx.event.event("share", ActionResult::Success);
            event.action_target = Some(id.to_hex());
            event.resources = serde_json::to_value(&view).ok();
            state.publish_event(event);
            Ok(Json(view))
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "share",
                ActionResult::Failure,
                Some(id.to_hex()),
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

async fn grant_share_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    body: &ShareRequest,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    require_mutable(&object)?;
    let rollup = require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            share: true,
            ..Default::default()
        },
        "share this object",
    )?;
    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;
    if body.change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }
    if !(body.allow_create
        || body.allow_read
        || body.allow_update
        || body.allow_delete
        || body.allow_share)
    {
        return Err(AppError::bad_request("The share grants no capabilities"));
    }

    let mut shared = object;
    for resource in body.resources()? {
        let mut grant = Permission::for_resource(
            &resource,
            body.allow_create,
            body.allow_read,
            body.allow_update,
            body.allow_delete,
            body.allow_share,
        );
        if reduce_grants(&shared.permissions, &grant) {
            tracing::debug!(grantee = %grant.grantee, "share grants nothing new, skipping");
            continue;
        }
        grant
            .copy_encrypt_key(state.master(), &rollup)
            .map_err(|e| {
                AppError::with_cause(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to wrap file key",
                    e,
                )
            })?;
        shared.permissions.push(grant);
    }

    shared.modified_by = ctx.dn().to_string();
    apply_acm_pipeline(state, ctx, &mut shared, AcmRewrite::Inject).await?;

    let updated = state
        .store()
        .update_object(shared, &body.change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist share"))?;
    Ok(ObjectView::of(&updated))
}

/// Revoke the grants held by the principals named in the share fragment.
/// The ACM share is rebuilt from the surviving permissions; the owner can
/// never lose their own access this way.
pub async fn revoke_share(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<ShareRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    match revoke_share_core(&state, &ctx, id, &body).await {
        Ok(view) => {
            let mut event = ctx.event.event("unshare", ActionResult::Success);
            event.action_target = Some(id.to_hex());
            event.resources = serde_json::to_value(&view).ok();
            state.publish_event(event);
            Ok(Json(view))
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "unshare",
                ActionResult::Failure,
                Some(id.to_hex()),
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

async fn revoke_share_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    body: &ShareRequest,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    require_mutable(&object)?;
    require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            share: true,
            ..Default::default()
        },
        "modify shares of this object",
    )?;
    if body.change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }

    let revoked: Vec<String> = body
        .resources()?
        .iter()
        .map(|r| flatten(&r.grantee()))
        .collect();

    let mut remaining = object;
    for permission in remaining.permissions.iter_mut() {
        if !permission.is_deleted && revoked.contains(&flatten(&permission.grantee)) {
            permission.is_deleted = true;
        }
    }

    remaining.modified_by = ctx.dn().to_string();
    apply_acm_pipeline(state, ctx, &mut remaining, AcmRewrite::Rebuild).await?;

    let updated = state
        .store()
        .update_object(remaining, &body.change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist share revocation"))?;
    Ok(ObjectView::of(&updated))
}

/// Objects shared to the caller by others
pub async fn shared_to_me(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .store()
        .get_objects_shared_to_me(ctx.dn(), &ctx.groups, paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list shares"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

/// Objects the caller has shared with others
pub async fn shared_by_me(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .store()
        .get_objects_i_have_shared(ctx.dn(), paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list shares"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

/// Objects readable by everyone
pub async fn shared_to_everyone(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Query(paging): Query<PagingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .store()
        .get_objects_shared_to_everyone(paging.to_page())
        .await
        .map_err(|e| AppError::from_store(e, "unable to list public shares"))?;
    Ok(Json(paged_views(&state, &ctx, page).await))
}

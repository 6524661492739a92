use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::events::{ActionResult, ModifiedPair};
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::{
    apply_acm_pipeline, fetch_object, parse_acm, parse_object_id, require_caps,
    require_mutable, AcmRewrite, Caps, ObjectView, PermissionView,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateObjectRequest {
    pub change_token: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub type_name: Option<String>,
    pub acm: Option<serde_json::Value>,
    pub permissions: Option<Vec<PermissionView>>,
}

/// Update object metadata.
///
/// Parent, owner, and content pointers are retained from the existing
/// record; content changes go through the stream update. An omitted ACM or
/// permission list means "keep current"; when both are present the existing
/// permissions are replaced. A changed share additionally requires the
/// share capability.
pub async fn update_properties(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateObjectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let result = update_core(&state, &ctx, id, body).await;
    match result {
        Ok((view, pair)) => {
            let mut event = ctx.event.event("update", ActionResult::Success);
            event.action_target = Some(view.id.clone());
            event.resources = serde_json::to_value(&view).ok();
            event.modified_pairs = vec![pair];
            state.publish_event(event);
            Ok(Json(view))
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "update",
                ActionResult::Failure,
                Some(id.to_hex()),
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

async fn update_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: common::models::ObjectId,
    body: UpdateObjectRequest,
) -> Result<(ObjectView, ModifiedPair), AppError> {
    let current = fetch_object(state, id).await?;
    require_mutable(&current)?;

    let rollup = require_caps(
        state,
        ctx,
        &current,
        Caps {
            read: true,
            update: true,
            ..Default::default()
        },
        "update this object",
    )?;
    state
        .access()
        .check_access(ctx.dn(), &current.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    if body.change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }

    let before = ObjectView::of(&current);
    let mut object = current.clone();

    if let Some(name) = body.name {
        if name.contains('/') || name.contains('\\') {
            return Err(AppError::bad_request(
                "Object names may not contain path delimiters",
            ));
        }
        if !name.is_empty() {
            object.name = name;
        }
    }
    if let Some(description) = body.description {
        object.description = description;
    }
    if let Some(type_name) = body.type_name {
        if !type_name.is_empty() {
            object.type_name = type_name;
        }
    }

    if let Some(acm_value) = &body.acm {
        let acm = parse_acm(acm_value)?;
        if acm.share_differs(&object.raw_acm) {
            require_caps(
                state,
                ctx,
                &current,
                Caps {
                    read: true,
                    share: true,
                    ..Default::default()
                },
                "change the share of this object",
            )?;
        }
        object.raw_acm = acm;
    }

    if let Some(permission_views) = &body.permissions {
        // Replace: retire every existing grant, add the incoming ones
        for permission in object.permissions.iter_mut() {
            permission.is_deleted = true;
        }
        for view in permission_views {
            let mut permission = view.to_permission()?;
            permission.copy_encrypt_key(state.master(), &rollup).map_err(|e| {
                AppError::with_cause(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to wrap file key",
                    e,
                )
            })?;
            object.permissions.push(permission);
        }
    }

    object.modified_by = ctx.dn().to_string();
    apply_acm_pipeline(state, ctx, &mut object, AcmRewrite::Inject).await?;

    let updated = state
        .store()
        .update_object(object, &body.change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist update"))?;

    let after = ObjectView::of(&updated);
    let pair = ModifiedPair {
        before: serde_json::to_value(&before).unwrap_or_default(),
        after: serde_json::to_value(&after).unwrap_or_default(),
    };
    Ok((after, pair))
}

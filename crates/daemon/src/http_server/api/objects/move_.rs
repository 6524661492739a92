use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};

use common::auth::is_user_owner;
use common::models::ObjectId;

use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::trash::ChangeTokenBody;
use super::{
    fetch_object, parse_object_id, require_caps, require_mutable, Caps, ObjectView,
};

/// Move an object under a new parent. Requires update capability and
/// ownership; the target must grant create and the move must not produce a
/// cycle in the parent graph.
pub(super) async fn move_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    change_token: &str,
    new_parent: Option<ObjectId>,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    require_mutable(&object)?;
    require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            update: true,
            ..Default::default()
        },
        "move this object",
    )?;
    if !is_user_owner(ctx.dn(), &ctx.groups, &object.owned_by) {
        return Err(AppError::forbidden(
            "Forbidden - only the owner may move this object",
        ));
    }
    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    if let Some(parent_id) = new_parent {
        if parent_id == id {
            return Err(AppError::new(
                http::StatusCode::CONFLICT,
                "An object cannot be moved beneath itself",
            ));
        }
        let parent = fetch_object(state, parent_id).await?;
        require_mutable(&parent)?;
        require_caps(
            state,
            ctx,
            &parent,
            Caps {
                create: true,
                read: true,
                ..Default::default()
            },
            "create objects under the target",
        )?;
        // Walking up from the target must never reach the object being
        // moved
        let ancestors = state
            .store()
            .get_parents(parent_id)
            .await
            .map_err(|e| AppError::from_store(e, "unable to walk target ancestry"))?;
        if ancestors.iter().any(|a| a.id == id) {
            return Err(AppError::new(
                http::StatusCode::CONFLICT,
                "The move would create a cycle in the parent graph",
            ));
        }
    }

    if change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }

    let mut moved = object;
    moved.parent_id = new_parent;
    moved.modified_by = ctx.dn().to_string();
    let updated = state
        .store()
        .update_object(moved, change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist move"))?;
    Ok(ObjectView::of(&updated))
}

async fn handle_move(
    state: ServiceState,
    ctx: RequestContext,
    id: String,
    folder: Option<String>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<Json<ObjectView>, AppError> {
    let id = parse_object_id(&id)?;
    let target = match folder {
        Some(folder) => Some(parse_object_id(&folder)?),
        None => None,
    };
    let token = body.map(|Json(b)| b.change_token).unwrap_or_default();
    match move_core(&state, &ctx, id, &token, target).await {
        Ok(view) => {
            let mut event = ctx.event.event("move", ActionResult::Success);
            event.action_target = Some(id.to_hex());
            event.resources = serde_json::to_value(&view).ok();
            state.publish_event(event);
            Ok(Json(view))
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "move",
                ActionResult::Failure,
                Some(id.to_hex()),
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

/// Move to the caller's root
pub async fn move_object(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    handle_move(state, ctx, id, None, body).await
}

/// Move under the named folder
pub async fn move_object_to_folder(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, folder)): Path<(String, String)>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    handle_move(state, ctx, id, Some(folder), body).await
}

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use common::auth::is_user_owner;
use common::models::{flatten, ObjectId, Permission, Resource};

use crate::database::PageRequest;
use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::trash::ChangeTokenBody;
use super::{
    apply_acm_pipeline, fetch_object, parse_object_id, require_caps, require_mutable,
    AcmRewrite, Caps, ObjectView,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeOwnerQuery {
    pub apply_recursively: bool,
}

/// Validate the target owner resource: a different user, or a group the
/// caller belongs to; never the everyone group.
pub(super) fn validate_new_owner_resource(
    ctx: &RequestContext,
    new_owner: &str,
) -> Result<Resource, AppError> {
    let resource = Resource::parse(new_owner)
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Invalid owner resource", e))?;
    if resource.is_everyone() {
        return Err(AppError::precondition(
            "Ownership may not be assigned to the everyone group",
        ));
    }
    match &resource {
        Resource::User { dn } => {
            if flatten(dn) == flatten(ctx.dn()) {
                return Err(AppError::precondition(
                    "The object is already owned by this user",
                ));
            }
        }
        Resource::Group { .. } => {
            let grantee = resource.grantee();
            if !ctx.groups.iter().any(|g| flatten(g) == flatten(&grantee)) {
                return Err(AppError::precondition(
                    "Ownership may only be transferred to a group the caller is a member of",
                ));
            }
        }
    }
    Ok(resource)
}

/// Transfer ownership: the new owner gains full capabilities, the object is
/// re-normalized against its ACM, and lands at the new owner's root.
pub(super) async fn change_owner_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
    change_token: &str,
    new_owner: &Resource,
) -> Result<ObjectView, AppError> {
    let object = fetch_object(state, id).await?;
    require_mutable(&object)?;
    let rollup = require_caps(
        state,
        ctx,
        &object,
        Caps {
            read: true,
            update: true,
            ..Default::default()
        },
        "change the owner of this object",
    )?;
    if !is_user_owner(ctx.dn(), &ctx.groups, &object.owned_by) {
        return Err(AppError::forbidden(
            "Forbidden - only the owner may transfer ownership",
        ));
    }
    if change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }

    let mut transferred = object;
    transferred.owned_by = new_owner.to_string();
    transferred.parent_id = None;
    transferred.modified_by = ctx.dn().to_string();

    let mut grant = Permission::for_resource(new_owner, true, true, true, true, true);
    grant
        .copy_encrypt_key(state.master(), &rollup)
        .map_err(|e| {
            AppError::with_cause(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to wrap file key",
                e,
            )
        })?;
    transferred.permissions.push(grant);

    apply_acm_pipeline(state, ctx, &mut transferred, AcmRewrite::Inject).await?;

    let updated = state
        .store()
        .update_object(transferred, change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist ownership transfer"))?;
    Ok(ObjectView::of(&updated))
}

pub async fn change_owner(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, new_owner)): Path<(String, String)>,
    Query(query): Query<ChangeOwnerQuery>,
    body: Option<Json<ChangeTokenBody>>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    let token = body.map(|Json(b)| b.change_token).unwrap_or_default();
    let resource = validate_new_owner_resource(&ctx, &new_owner)?;

    match change_owner_core(&state, &ctx, id, &token, &resource).await {
        Ok(view) => {
            let mut event = ctx.event.event("owner", ActionResult::Success);
            event.action_target = Some(id.to_hex());
            event.resources = serde_json::to_value(&view).ok();
            state.publish_event(event);
            if query.apply_recursively {
                spawn_recursive_transfer(state.clone(), ctx.clone(), id, resource);
            }
            Ok(Json(view))
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "owner",
                ActionResult::Failure,
                Some(id.to_hex()),
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

/// Transfer all eligible descendants, page by page. A child whose
/// normalization fails is logged, audited as a failure, and skipped; the
/// walk continues.
fn spawn_recursive_transfer(
    state: ServiceState,
    ctx: RequestContext,
    root: ObjectId,
    new_owner: Resource,
) {
    tokio::spawn(async move {
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            let mut page = PageRequest {
                page_number: 1,
                page_size: 100,
            };
            loop {
                let listing = match state.store().get_children(parent, page).await {
                    Ok(listing) => listing,
                    Err(e) => {
                        tracing::warn!(parent = %parent, error = %e, "recursive transfer cannot list children");
                        break;
                    }
                };
                for child in &listing.objects {
                    frontier.push(child.id);
                    if !is_user_owner(ctx.dn(), &ctx.groups, &child.owned_by) {
                        continue;
                    }
                    let token = child.change_token.clone();
                    match change_owner_core(&state, &ctx, child.id, &token, &new_owner).await
                    {
                        Ok(view) => {
                            let mut event =
                                ctx.event.event("owner", ActionResult::Success);
                            event.action_target = Some(child.id.to_hex());
                            event.resources = serde_json::to_value(&view).ok();
                            state.publish_event(event);
                        }
                        Err(e) => {
                            tracing::warn!(
                                child = %child.id,
                                code = e.code.as_u16(),
                                msg = %e.msg,
                                "recursive transfer skipping child"
                            );
                            state.audit(
                                &ctx.event,
                                "owner",
                                ActionResult::Failure,
                                Some(child.id.to_hex()),
                                vec![e.code.as_u16().to_string()],
                            );
                        }
                    }
                }
                if page.page_number >= listing.page_count {
                    break;
                }
                page.page_number += 1;
            }
        }
    });
}

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::move_::move_core;
use super::owner::change_owner_core;
use super::trash::trash_core;
use super::{fetch_object, parse_object_id, require_caps, Caps, ObjectView};

/// Reference to one object within a bulk request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRef {
    pub object_id: String,
    pub change_token: String,
    /// Target parent for bulk moves; empty means root
    pub parent_id: String,
}

/// Per-object outcome in a bulk response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResult {
    pub object_id: String,
    pub code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectView>,
}

impl ObjectResult {
    fn ok(object_id: String, view: ObjectView) -> Self {
        ObjectResult {
            object_id,
            code: 200,
            error: String::new(),
            msg: String::new(),
            object: Some(view),
        }
    }

    fn err(object_id: String, e: &AppError) -> Self {
        ObjectResult {
            object_id,
            code: e.code.as_u16(),
            error: e.msg.clone(),
            msg: e.cause.clone().unwrap_or_default(),
            object: None,
        }
    }
}

fn audit_item(
    state: &ServiceState,
    ctx: &RequestContext,
    action: &str,
    result: &Result<ObjectView, AppError>,
    object_id: &str,
) {
    match result {
        Ok(view) => {
            let mut event = ctx.event.event(action, ActionResult::Success);
            event.action_target = Some(object_id.to_string());
            event.resources = serde_json::to_value(view).ok();
            state.publish_event(event);
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                action,
                ActionResult::Failure,
                Some(object_id.to_string()),
                vec![e.code.as_u16().to_string()],
            );
        }
    }
}

/// Bulk soft delete. Always 200 with a per-object result list.
pub async fn bulk_delete(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Json(refs): Json<Vec<ObjectRef>>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(refs.len());
    for reference in refs {
        let outcome = match parse_object_id(&reference.object_id) {
            Ok(id) => {
                let result = trash_core(&state, &ctx, id, &reference.change_token).await;
                audit_item(&state, &ctx, "delete", &result, &reference.object_id);
                result
            }
            Err(e) => Err(e),
        };
        results.push(match outcome {
            Ok(view) => ObjectResult::ok(reference.object_id, view),
            Err(e) => ObjectResult::err(reference.object_id, &e),
        });
    }
    Json(results)
}

/// Bulk move. Always 200 with a per-object result list.
pub async fn bulk_move(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Json(refs): Json<Vec<ObjectRef>>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(refs.len());
    for reference in refs {
        let outcome = async {
            let id = parse_object_id(&reference.object_id)?;
            let parent = if reference.parent_id.is_empty() {
                None
            } else {
                Some(parse_object_id(&reference.parent_id)?)
            };
            let result = move_core(&state, &ctx, id, &reference.change_token, parent).await;
            audit_item(&state, &ctx, "move", &result, &reference.object_id);
            result
        }
        .await;
        results.push(match outcome {
            Ok(view) => ObjectResult::ok(reference.object_id, view),
            Err(e) => ObjectResult::err(reference.object_id, &e),
        });
    }
    Json(results)
}

/// Bulk ownership transfer to the owner named in the path
pub async fn bulk_change_owner(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(new_owner): Path<String>,
    Json(refs): Json<Vec<ObjectRef>>,
) -> Result<impl IntoResponse, AppError> {
    let resource = super::owner::validate_new_owner_resource(&ctx, &new_owner)?;
    let mut results = Vec::with_capacity(refs.len());
    for reference in refs {
        let outcome = match parse_object_id(&reference.object_id) {
            Ok(id) => {
                let result =
                    change_owner_core(&state, &ctx, id, &reference.change_token, &resource)
                        .await;
                audit_item(&state, &ctx, "owner", &result, &reference.object_id);
                result
            }
            Err(e) => Err(e),
        };
        results.push(match outcome {
            Ok(view) => ObjectResult::ok(reference.object_id, view),
            Err(e) => ObjectResult::err(reference.object_id, &e),
        });
    }
    Ok(Json(results))
}

/// Bulk metadata read: ids in, per-object properties or error out
pub async fn bulk_properties(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Json(ids): Json<Vec<String>>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(ids.len());
    for raw_id in ids {
        let outcome = async {
            let id = parse_object_id(&raw_id)?;
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
            Ok(ObjectView::of(&object))
        }
        .await;
        results.push(match outcome {
            Ok(view) => ObjectResult::ok(raw_id, view),
            Err(e) => ObjectResult::err(raw_id, &e),
        });
    }
    Json(results)
}

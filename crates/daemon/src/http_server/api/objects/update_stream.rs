use axum::extract::{Multipart, State};
use axum::extract::Path;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::events::{ActionResult, ModifiedPair};
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::service_config::MAX_METADATA_BYTES;
use crate::state::ServiceState;

use super::create::{stage_content, spawn_drain, METADATA_PART};
use super::{
    apply_acm_pipeline, fetch_object, parse_object_id, require_caps, require_mutable,
    AcmRewrite, Caps, ObjectView,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateStreamRequest {
    pub change_token: String,
    pub content_type: Option<String>,
}

/// Replace object content. A fresh content connector and IV are allocated;
/// the per-object file key is retained so existing grants keep decrypting.
pub async fn update_stream(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_object_id(&id)?;
    match update_stream_core(&state, &ctx, id, multipart).await {
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

async fn update_stream_core(
    state: &ServiceState,
    ctx: &RequestContext,
    id: common::models::ObjectId,
    mut multipart: Multipart,
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
    let file_key = rollup.file_key(state.master()).map_err(|e| {
        AppError::with_cause(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to derive file key from permission",
            e,
        )
    })?;
    state
        .access()
        .check_access(ctx.dn(), &current.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed multipart payload", e))?
        .ok_or_else(|| AppError::bad_request("Multipart payload is empty"))?;
    if field.name() != Some(METADATA_PART) {
        return Err(AppError::bad_request(format!(
            "The first part must be named {}",
            METADATA_PART
        )));
    }
    let metadata = field
        .bytes()
        .await
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Unable to read metadata part", e))?;
    if metadata.len() > MAX_METADATA_BYTES {
        return Err(AppError::bad_request("Metadata part exceeds the size limit"));
    }
    let body: UpdateStreamRequest = serde_json::from_slice(&metadata)
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed JSON", e))?;
    if body.change_token.is_empty() {
        return Err(AppError::precondition(
            "A changeToken matching the current object is required",
        ));
    }

    let before = ObjectView::of(&current);
    let mut object = current.clone();

    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed multipart payload", e))?
        .ok_or_else(|| AppError::bad_request("Multipart payload has no content part"))?;
    stage_content(state, &mut object, &file_key, field, body.content_type).await?;

    object.modified_by = ctx.dn().to_string();
    apply_acm_pipeline(state, ctx, &mut object, AcmRewrite::Inject).await?;

    let updated = state
        .store()
        .update_object(object, &body.change_token)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist stream update"))?;
    spawn_drain(state, &updated);

    let after = ObjectView::of(&updated);
    let pair = ModifiedPair {
        before: serde_json::to_value(&before).unwrap_or_default(),
        after: serde_json::to_value(&after).unwrap_or_default(),
    };
    Ok((after, pair))
}

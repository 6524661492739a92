use axum::extract::multipart::Field;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use http::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use common::crypto::{self, ContentCipher};
use common::models::{DriveObject, ObjectId, Permission};
use common::permissions::consolidate;

use crate::ciphertext::FileId;
use crate::database::PageRequest;
use crate::events::ActionResult;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::service_config::MAX_METADATA_BYTES;
use crate::state::ServiceState;

use super::{
    apply_acm_pipeline, parse_acm, parse_object_id, AcmRewrite, Caps, ObjectView,
    PermissionView,
};

/// Name of the multipart field carrying the JSON metadata
pub const METADATA_PART: &str = "ObjectMetadata";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateObjectRequest {
    pub name: String,
    pub type_name: String,
    pub description: String,
    pub parent_id: String,
    pub acm: serde_json::Value,
    pub permissions: Vec<PermissionView>,
    pub content_type: Option<String>,
}

/// Create an object from either a JSON body or a multipart payload whose
/// first part is the metadata and whose second part streams the content.
pub async fn create_object(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    request: Request,
) -> Result<Response, AppError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false);

    let result = if is_multipart {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Bad Content-Type", e))?;
        create_with_stream(&state, &ctx, multipart).await
    } else {
        let Json(body): Json<CreateObjectRequest> = Json::from_request(request, &())
            .await
            .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed JSON", e))?;
        create_metadata_only(&state, &ctx, body).await
    };

    match result {
        Ok(object) => {
            let view = ObjectView::of(&object);
            let mut event = ctx.event.event("create", ActionResult::Success);
            event.action_target = Some(object.id.to_hex());
            event.resources = serde_json::to_value(&view).ok();
            state.publish_event(event);
            Ok(Json(view).into_response())
        }
        Err(e) => {
            state.audit(
                &ctx.event,
                "create",
                ActionResult::Failure,
                None,
                vec![e.code.as_u16().to_string()],
            );
            Err(e)
        }
    }
}

async fn create_metadata_only(
    state: &ServiceState,
    ctx: &RequestContext,
    body: CreateObjectRequest,
) -> Result<DriveObject, AppError> {
    let mut object = build_object(state, ctx, &body).await?;
    finish_create(state, ctx, &mut object).await?;
    state
        .store()
        .create_object(object)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist object"))
}

async fn create_with_stream(
    state: &ServiceState,
    ctx: &RequestContext,
    mut multipart: Multipart,
) -> Result<DriveObject, AppError> {
    // The metadata part must come first
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
    let body: CreateObjectRequest = serde_json::from_slice(&metadata)
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed JSON", e))?;

    let mut object = build_object(state, ctx, &body).await?;
    let file_key = finish_create(state, ctx, &mut object).await?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Malformed multipart payload", e))?
        .ok_or_else(|| AppError::bad_request("Multipart payload has no content part"))?;
    stage_content(state, &mut object, &file_key, field, body.content_type).await?;

    let object = state
        .store()
        .create_object(object)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist object"))?;

    spawn_drain(state, &object);
    Ok(object)
}

/// Validate the content part and stream it, encrypted, into the cache.
/// The handler may not report success until the ciphertext reached the
/// uploaded state and the metadata committed.
pub(super) async fn stage_content(
    state: &ServiceState,
    object: &mut DriveObject,
    file_key: &[u8; 32],
    mut field: Field<'_>,
    declared_content_type: Option<String>,
) -> Result<(), AppError> {
    let file_name = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("Content part must include a filename"))?;

    if let Some(encoding) = field
        .headers()
        .get("content-transfer-encoding")
        .and_then(|v| v.to_str().ok())
    {
        let encoding = encoding.to_ascii_lowercase();
        if !matches!(encoding.as_str(), "binary" | "7bit" | "8bit") {
            return Err(AppError::bad_request(format!(
                "Unsupported Content-Transfer-Encoding {}",
                encoding
            )));
        }
    }
    let part_content_type = field.content_type().map(str::to_string);
    if let Some(ct) = part_content_type.as_deref() {
        if let Some(charset) = ct
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("charset="))
            .next()
        {
            let charset = charset.trim_matches('"').to_ascii_lowercase();
            if charset != "utf-8" && charset != "iso-8859-1" {
                return Err(AppError::bad_request(format!(
                    "Unsupported charset {}",
                    charset
                )));
            }
        }
    }

    let cache = state.cache();
    let iv = crypto::create_content_iv();
    let mut cipher = ContentCipher::new(file_key, &iv)
        .map_err(|e| AppError::with_cause(http::StatusCode::INTERNAL_SERVER_ERROR, "Unable to initialize cipher", e))?;
    let rname = FileId::generate();
    let mut staged = cache
        .begin_upload(&rname)
        .await
        .map_err(|e| AppError::from_cache(e, "unable to stage upload"))?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(staged);
                cache.abort_upload(&rname).await;
                return Err(AppError::with_cause(
                    http::StatusCode::BAD_REQUEST,
                    "Error reading upload stream",
                    e,
                ));
            }
        };
        let mut buffer = chunk.to_vec();
        cipher.encrypt_chunk(&mut buffer);
        if let Err(e) = staged.write_all(&buffer).await {
            drop(staged);
            cache.abort_upload(&rname).await;
            return Err(AppError::with_cause(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "Error writing upload to cache",
                e,
            ));
        }
    }
    if let Err(e) = staged.flush().await {
        drop(staged);
        cache.abort_upload(&rname).await;
        return Err(AppError::with_cause(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "Error writing upload to cache",
            e,
        ));
    }
    drop(staged);
    cache
        .commit_upload(&rname)
        .await
        .map_err(|e| AppError::from_cache(e, "unable to commit upload"))?;

    let (hash, size) = cipher.finish();
    object.content_connector = Some(rname.to_string());
    object.content_size = size as i64;
    object.content_hash = Some(hash);
    object.encrypt_iv = Some(iv);
    object.content_type = declared_content_type
        .or(part_content_type)
        .or_else(|| {
            Some(
                mime_guess::from_path(&file_name)
                    .first_or_octet_stream()
                    .to_string(),
            )
        });
    if object.name.is_empty() {
        object.name = file_name;
    }
    Ok(())
}

/// Opportunistically drain the fresh upload to durable storage
pub(super) fn spawn_drain(state: &ServiceState, object: &DriveObject) {
    if let Some(connector) = object.content_connector.clone() {
        let cache = std::sync::Arc::clone(state.cache());
        tokio::spawn(async move {
            if let Ok(id) = FileId::parse(&connector) {
                if let Err(e) = cache.writeback(&id).await {
                    tracing::warn!(id = %id, error = %e, "initial drain failed, leaving for drain loop");
                }
            }
        });
    }
}

async fn build_object(
    state: &ServiceState,
    ctx: &RequestContext,
    body: &CreateObjectRequest,
) -> Result<DriveObject, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::bad_request("Object name is required"));
    }
    if body.acm.is_null() {
        return Err(AppError::bad_request("Missing ACM"));
    }
    let acm = parse_acm(&body.acm)?;

    let mut parent = if body.parent_id.is_empty() {
        None
    } else {
        Some(parse_object_id(&body.parent_id)?)
    };
    if let Some(parent_id) = parent {
        let parent_object = super::fetch_object(state, parent_id).await?;
        if parent_object.is_expunged {
            return Err(AppError::gone("The parent no longer exists."));
        }
        if parent_object.is_deleted {
            return Err(AppError::precondition(
                "The parent is in the trash; objects cannot be created under it",
            ));
        }
        super::require_caps(
            state,
            ctx,
            &parent_object,
            Caps {
                create: true,
                read: true,
                ..Default::default()
            },
            "create objects under the parent",
        )?;
    }

    // Names carrying path delimiters create intermediate folders
    let (resolved_parent, leaf) =
        ensure_path_folders(state, ctx, parent.take(), &body.name, &acm).await?;

    let type_name = if body.type_name.is_empty() {
        "File".to_string()
    } else {
        body.type_name.clone()
    };
    let owner = format!("user/{}", ctx.dn());
    let mut object = DriveObject::new(leaf, type_name, owner, acm, ctx.dn());
    object.description = body.description.clone();
    object.parent_id = resolved_parent;
    object.content_type = body.content_type.clone();

    // Owner gets create/update/delete/share implicitly; read comes via the
    // ACM share.
    object
        .permissions
        .push(Permission::for_user(ctx.dn(), true, false, true, true, true));
    for view in &body.permissions {
        object.permissions.push(view.to_permission()?);
    }
    Ok(object)
}

/// Key the permissions, run the ACM pipeline, and consolidate duplicates.
/// Returns the per-object file key for content staging.
async fn finish_create(
    state: &ServiceState,
    ctx: &RequestContext,
    object: &mut DriveObject,
) -> Result<[u8; 32], AppError> {
    let file_key = crypto::create_key();
    for permission in object.permissions.iter_mut() {
        permission
            .set_encrypt_key(state.master(), &file_key)
            .map_err(|e| {
                AppError::with_cause(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to wrap file key",
                    e,
                )
            })?;
    }
    apply_acm_pipeline(state, ctx, object, AcmRewrite::Inject).await?;
    consolidate(&mut object.permissions, state.master());
    Ok(file_key)
}

/// Resolve path-delimited names: every leading segment becomes a folder
/// under the current parent, and the leaf keeps the final segment.
async fn ensure_path_folders(
    state: &ServiceState,
    ctx: &RequestContext,
    mut parent: Option<ObjectId>,
    name: &str,
    acm: &common::acm::AcmDocument,
) -> Result<(Option<ObjectId>, String), AppError> {
    if !name.contains('/') && !name.contains('\\') {
        return Ok((parent, name.to_string()));
    }
    let normalized = name.replace('\\', "/");
    let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    let Some(leaf) = segments.pop() else {
        return Err(AppError::bad_request("Object name is required"));
    };
    for segment in segments {
        parent = Some(find_or_create_folder(state, ctx, parent, segment, acm).await?);
    }
    Ok((parent, leaf.to_string()))
}

async fn find_or_create_folder(
    state: &ServiceState,
    ctx: &RequestContext,
    parent: Option<ObjectId>,
    name: &str,
    acm: &common::acm::AcmDocument,
) -> Result<ObjectId, AppError> {
    // Look for an existing folder of that name under the parent
    let mut page = PageRequest {
        page_number: 1,
        page_size: 500,
    };
    loop {
        let listing = match parent {
            Some(parent_id) => state.store().get_children(parent_id, page).await,
            None => {
                state
                    .store()
                    .get_root_objects(&format!("user/{}", ctx.dn()), page)
                    .await
            }
        }
        .map_err(|e| AppError::from_store(e, "unable to list folder candidates"))?;
        for candidate in &listing.objects {
            if candidate.type_name == "Folder" && candidate.name == name {
                return Ok(candidate.id);
            }
        }
        if page.page_number >= listing.page_count {
            break;
        }
        page.page_number += 1;
    }

    let mut folder = DriveObject::new(
        name,
        "Folder",
        format!("user/{}", ctx.dn()),
        acm.clone(),
        ctx.dn(),
    );
    folder.parent_id = parent;
    folder
        .permissions
        .push(Permission::for_user(ctx.dn(), true, false, true, true, true));
    let folder_key = crypto::create_key();
    for permission in folder.permissions.iter_mut() {
        permission
            .set_encrypt_key(state.master(), &folder_key)
            .map_err(|e| {
                AppError::with_cause(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to wrap file key",
                    e,
                )
            })?;
    }
    apply_acm_pipeline(state, ctx, &mut folder, AcmRewrite::Inject).await?;
    let folder = state
        .store()
        .create_object(folder)
        .await
        .map_err(|e| AppError::from_store(e, "unable to persist folder"))?;
    Ok(folder.id)
}

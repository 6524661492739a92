pub mod bulk;
pub mod create;
pub mod get;
pub mod list;
pub mod move_;
pub mod owner;
pub mod revisions;
pub mod search;
pub mod shares;
pub mod stream;
pub mod trash;
pub mod update;
pub mod update_stream;

use serde::{Deserialize, Serialize};

use common::acm::AcmDocument;
use common::models::{DriveObject, ObjectId, Permission};
use common::permissions::{self, normalize_read_permissions, rollup, PermissionError};

pub use common::permissions::Caps;

use crate::database::PageRequest;
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

/// Paging parameters accepted by every listing endpoint
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PagingQuery {
    pub page_number: Option<u64>,
    pub page_size: Option<u64>,
}

impl PagingQuery {
    pub fn to_page(self) -> PageRequest {
        let default = PageRequest::default();
        PageRequest {
            page_number: self.page_number.unwrap_or(default.page_number),
            page_size: self.page_size.unwrap_or(default.page_size),
        }
    }
}

/// Wire form of a permission grant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionView {
    pub grantee: String,
    pub resource_string: String,
    pub allow_create: bool,
    pub allow_read: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub allow_share: bool,
    pub explicit_share: bool,
}

impl Default for PermissionView {
    fn default() -> Self {
        PermissionView {
            grantee: String::new(),
            resource_string: String::new(),
            allow_create: false,
            allow_read: false,
            allow_update: false,
            allow_delete: false,
            allow_share: false,
            explicit_share: false,
        }
    }
}

impl PermissionView {
    pub fn of(permission: &Permission) -> Self {
        PermissionView {
            grantee: permission.grantee.clone(),
            resource_string: permission.acm_grantee.resource_string.clone(),
            allow_create: permission.allow_create,
            allow_read: permission.allow_read,
            allow_update: permission.allow_update,
            allow_delete: permission.allow_delete,
            allow_share: permission.allow_share,
            explicit_share: permission.explicit_share,
        }
    }

    /// Convert an incoming grant into a model permission
    pub fn to_permission(&self) -> Result<Permission, AppError> {
        let resource = common::models::Resource::parse(&self.resource_string)
            .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Invalid resource string", e))?;
        Ok(Permission::for_resource(
            &resource,
            self.allow_create,
            self.allow_read,
            self.allow_update,
            self.allow_delete,
            self.allow_share,
        ))
    }
}

/// One step in the ancestry trail, included only for ancestors the caller
/// is authorized to read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub id: String,
    pub parent_id: String,
    pub name: String,
}

/// Wire form of an object
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectView {
    pub id: String,
    pub name: String,
    pub type_name: String,
    pub description: String,
    pub parent_id: String,
    pub owned_by: String,
    pub acm: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub change_count: i64,
    pub change_token: String,
    pub is_deleted: bool,
    pub is_ancestor_deleted: bool,
    pub is_expunged: bool,
    pub created_date: chrono::DateTime<chrono::Utc>,
    pub created_by: String,
    pub modified_date: chrono::DateTime<chrono::Utc>,
    pub modified_by: String,
    pub permissions: Vec<PermissionView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<Breadcrumb>,
}

impl ObjectView {
    pub fn of(object: &DriveObject) -> Self {
        ObjectView {
            id: object.id.to_hex(),
            name: object.name.clone(),
            type_name: object.type_name.clone(),
            description: object.description.clone(),
            parent_id: object
                .parent_id
                .map(|p| p.to_hex())
                .unwrap_or_default(),
            owned_by: object.owned_by.clone(),
            acm: object.raw_acm.to_value(),
            content_type: object.content_type.clone(),
            content_size: object.content_size,
            content_hash: object.content_hash.as_ref().map(hex::encode),
            change_count: object.change_count,
            change_token: object.change_token.clone(),
            is_deleted: object.is_deleted,
            is_ancestor_deleted: object.is_ancestor_deleted,
            is_expunged: object.is_expunged,
            created_date: object.created_date,
            created_by: object.created_by.clone(),
            modified_date: object.modified_date,
            modified_by: object.modified_by.clone(),
            permissions: object.live_permissions().map(PermissionView::of).collect(),
            breadcrumbs: Vec::new(),
        }
    }

    pub fn with_breadcrumbs(mut self, breadcrumbs: Vec<Breadcrumb>) -> Self {
        self.breadcrumbs = breadcrumbs;
        self
    }
}

/// Fetch an object or 404
pub async fn fetch_object(
    state: &ServiceState,
    id: ObjectId,
) -> Result<DriveObject, AppError> {
    state
        .store()
        .get_object(id)
        .await
        .map_err(|e| AppError::from_store(e, "unable to load object"))
}

/// Lifecycle gate for read access: expunged objects are gone, a trashed
/// ancestor blocks reachability.
pub fn require_reachable(object: &DriveObject) -> Result<(), AppError> {
    if object.is_expunged {
        return Err(AppError::gone("The object no longer exists."));
    }
    if object.is_ancestor_deleted {
        return Err(AppError::method_not_allowed(
            "The object cannot be read because an ancestor is deleted.",
        ));
    }
    Ok(())
}

/// Lifecycle gate for mutations: nothing in the trash may be modified
pub fn require_mutable(object: &DriveObject) -> Result<(), AppError> {
    require_reachable(object)?;
    if object.is_deleted {
        return Err(AppError::method_not_allowed(
            "The object is currently in the trash. Restore it before updating it.",
        ));
    }
    Ok(())
}

/// Capability check against the caller's rolled-up grants. Returns the
/// rollup permission so stream handlers can recover the file key from it.
pub fn require_caps(
    state: &ServiceState,
    ctx: &RequestContext,
    object: &DriveObject,
    required: Caps,
    what: &str,
) -> Result<Permission, AppError> {
    let (ok, permission) = rollup(
        state.master(),
        ctx.dn(),
        &ctx.groups,
        &object.permissions,
        required,
    );
    if !ok {
        return Err(AppError::forbidden(format!(
            "Forbidden - User does not have permission to {}",
            what
        )));
    }
    permission.ok_or_else(|| AppError::internal("rollup produced no permission"))
}

/// How the ACM is re-synthesized from permissions before authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmRewrite {
    /// Add read grants missing from the share
    Inject,
    /// Reset the share to exactly the live read grants
    Rebuild,
}

/// The consistency pipeline every mutating handler runs before persisting:
/// rewrite the share from permissions, flatten through the authorization
/// service, normalize permissions back from the ACM, and verify the caller
/// still passes the rebuilt ACM. Failure persists nothing.
pub async fn apply_acm_pipeline(
    state: &ServiceState,
    ctx: &RequestContext,
    object: &mut DriveObject,
    rewrite: AcmRewrite,
) -> Result<(), AppError> {
    match rewrite {
        AcmRewrite::Inject => permissions::inject_permissions_into_acm(object),
        AcmRewrite::Rebuild => permissions::rebuild_acm_from_permissions(object),
    }

    let flattened = state
        .access()
        .flatten_acm(&object.raw_acm)
        .await
        .map_err(AppError::from_access)?;
    for message in &flattened.messages {
        tracing::warn!(message = %message, "acm flatten message");
    }
    object.raw_acm = flattened.acm;

    normalize_read_permissions(object, state.master()).map_err(|e| match e {
        PermissionError::EveryoneOwner => {
            AppError::precondition("The everyone group may not own objects")
        }
        PermissionError::InvalidOwner(e) => {
            AppError::with_cause(http::StatusCode::BAD_REQUEST, "Invalid owner resource", e)
        }
        other => AppError::with_cause(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to normalize permissions",
            other,
        ),
    })?;

    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;
    Ok(())
}

/// Drop listing entries whose ACM the caller cannot read
pub async fn filter_authorized(
    state: &ServiceState,
    ctx: &RequestContext,
    objects: Vec<DriveObject>,
) -> Vec<DriveObject> {
    let mut visible = Vec::with_capacity(objects.len());
    for object in objects {
        if state
            .access()
            .check_access(ctx.dn(), &object.raw_acm)
            .await
            .is_ok()
        {
            visible.push(object);
        }
    }
    visible
}

/// Breadcrumbs for the object: ancestors the caller is authorized to read,
/// root first.
pub async fn breadcrumbs_for(
    state: &ServiceState,
    ctx: &RequestContext,
    id: ObjectId,
) -> Vec<Breadcrumb> {
    let Ok(parents) = state.store().get_parents(id).await else {
        return Vec::new();
    };
    let mut crumbs = Vec::new();
    for parent in parents {
        if parent.is_deleted {
            continue;
        }
        if state
            .access()
            .check_access(ctx.dn(), &parent.raw_acm)
            .await
            .is_ok()
        {
            crumbs.push(Breadcrumb {
                id: parent.id.to_hex(),
                parent_id: parent.parent_id.map(|p| p.to_hex()).unwrap_or_default(),
                name: parent.name.clone(),
            });
        }
    }
    crumbs.reverse();
    crumbs
}

/// Parse a path id segment into an object id (400 on malformed hex)
pub fn parse_object_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::from_hex(raw).map_err(AppError::from)
}

/// Wrap the verified ACM document out of a raw request value
pub fn parse_acm(value: &serde_json::Value) -> Result<AcmDocument, AppError> {
    AcmDocument::from_value(value.clone())
        .map_err(|e| AppError::with_cause(http::StatusCode::BAD_REQUEST, "Missing or invalid ACM", e))
}

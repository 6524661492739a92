use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acm::AcmDocument;

use super::object::{DriveObject, ObjectId};
use super::permission::Permission;

/// Immutable historical snapshot of an object's first-class fields, keyed by
/// (object id, change count). Created implicitly on every update that changes
/// those fields; permissions carried here reflect the grants as they were at
/// that change count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub object_id: ObjectId,
    pub change_count: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content_connector: Option<String>,
    pub content_type: Option<String>,
    pub content_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<Vec<u8>>,
    #[serde(skip)]
    pub encrypt_iv: Option<[u8; 16]>,
    pub raw_acm: AcmDocument,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    pub modified_date: DateTime<Utc>,
    pub modified_by: String,
}

impl Revision {
    pub fn from_object(object: &DriveObject) -> Self {
        Revision {
            object_id: object.id,
            change_count: object.change_count,
            name: object.name.clone(),
            description: object.description.clone(),
            content_connector: object.content_connector.clone(),
            content_type: object.content_type.clone(),
            content_size: object.content_size,
            content_hash: object.content_hash.clone(),
            encrypt_iv: object.encrypt_iv,
            raw_acm: object.raw_acm.clone(),
            permissions: object.permissions.clone(),
            modified_date: object.modified_date,
            modified_by: object.modified_by.clone(),
        }
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::acm::AcmDocument;

use super::permission::Permission;

/// Size of an object identifier in bytes
pub const OBJECT_ID_SIZE: usize = 16;

/// Errors that can occur parsing object identifiers
#[derive(Debug, thiserror::Error)]
pub enum ObjectIdError {
    #[error("object id must be {expected} hex characters, got {got}")]
    Length { expected: usize, got: usize },
    #[error("object id is not valid hex")]
    Encoding,
}

/// Opaque 16-byte object identifier, rendered as 32 hex characters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    /// Generate a new random identifier using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0u8; OBJECT_ID_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        ObjectId(buff)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ObjectIdError> {
        if hex_str.len() != OBJECT_ID_SIZE * 2 {
            return Err(ObjectIdError::Length {
                expected: OBJECT_ID_SIZE * 2,
                got: hex_str.len(),
            });
        }
        let mut buff = [0u8; OBJECT_ID_SIZE];
        hex::decode_to_slice(hex_str, &mut buff).map_err(|_| ObjectIdError::Encoding)?;
        Ok(ObjectId(buff))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Generate a fresh opaque change token
pub fn new_change_token() -> String {
    let mut buff = [0u8; 16];
    getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
    hex::encode(buff)
}

/// The root stored entity: metadata, lifecycle state, the raw ACM, a pointer
/// to the ciphertext blob, and the attached permission list.
///
/// Invariants maintained by the store and the permission engine:
/// - a non-expunged object always carries a valid ACM
/// - `change_count` strictly increases and `change_token` is regenerated on
///   every successful update
/// - `is_expunged` implies `is_deleted`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveObject {
    pub id: ObjectId,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub description: String,
    pub parent_id: Option<ObjectId>,
    /// Resource string of the owner, `user/<dn>` or `group/...`
    pub owned_by: String,
    pub raw_acm: AcmDocument,
    /// Name of the ciphertext blob in the cache and durable storage
    pub content_connector: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_size: i64,
    /// sha256 of the plaintext, present once content has been uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<Vec<u8>>,
    /// Content cipher IV; never serialized to clients
    #[serde(skip)]
    pub encrypt_iv: Option<[u8; 16]>,
    pub change_count: i64,
    pub change_token: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_ancestor_deleted: bool,
    #[serde(default)]
    pub is_expunged: bool,
    pub created_date: DateTime<Utc>,
    pub created_by: String,
    pub modified_date: DateTime<Utc>,
    pub modified_by: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl DriveObject {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        owned_by: impl Into<String>,
        acm: AcmDocument,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let created_by = created_by.into();
        DriveObject {
            id: ObjectId::generate(),
            name: name.into(),
            type_name: type_name.into(),
            description: String::new(),
            parent_id: None,
            owned_by: owned_by.into(),
            raw_acm: acm,
            content_connector: None,
            content_type: None,
            content_size: 0,
            content_hash: None,
            encrypt_iv: None,
            change_count: 0,
            change_token: new_change_token(),
            is_deleted: false,
            is_ancestor_deleted: false,
            is_expunged: false,
            created_date: now,
            created_by: created_by.clone(),
            modified_date: now,
            modified_by: created_by,
            permissions: Vec::new(),
        }
    }

    /// Permissions that have not been marked deleted
    pub fn live_permissions(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter().filter(|p| !p.is_deleted)
    }

    pub fn has_content(&self) -> bool {
        self.content_connector.is_some() && self.content_size > 0
    }

    /// Trashed but recoverable: deleted without being expunged
    pub fn is_trashed(&self) -> bool {
        self.is_deleted && !self.is_expunged
    }

    /// The reduced shape served for objects sitting in the trash
    pub fn deleted_view(&self) -> DeletedObjectView {
        DeletedObjectView {
            id: self.id,
            is_deleted: self.is_deleted,
            is_ancestor_deleted: self.is_ancestor_deleted,
            is_expunged: self.is_expunged,
        }
    }
}

/// Projection returned when reading properties of a trashed object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedObjectView {
    pub id: ObjectId,
    pub is_deleted: bool,
    pub is_ancestor_deleted: bool,
    pub is_expunged: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_object_id_hex_round_trip() {
        let id = ObjectId::generate();
        let hex_str = id.to_hex();
        assert_eq!(hex_str.len(), 32);
        assert_eq!(ObjectId::from_hex(&hex_str).unwrap(), id);
    }

    #[test]
    fn test_object_id_rejects_bad_hex() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex(&"zz".repeat(16)).is_err());
    }

    #[test]
    fn test_change_tokens_are_unique() {
        assert_ne!(new_change_token(), new_change_token());
    }

    #[test]
    fn test_expunged_implies_deleted_projection() {
        let acm = AcmDocument::parse(r#"{"classif":"U"}"#).unwrap();
        let mut obj = DriveObject::new("f", "File", "user/cn=x", acm, "cn=x");
        obj.is_deleted = true;
        obj.is_expunged = true;
        let view = obj.deleted_view();
        assert!(view.is_deleted);
        assert!(view.is_expunged);
    }
}

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::models::{DriveObject, ObjectId, Revision};

pub use memory::MemoryObjectStore;

/// Errors surfaced by the object store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    /// The caller's change token does not match the persisted object
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("store error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Page selection for listing operations; pages are 1-based
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub page_number: u64,
    pub page_size: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            page_number: 1,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResults<T> {
    pub total_rows: u64,
    pub page_count: u64,
    pub page_number: u64,
    pub page_size: u64,
    pub objects: Vec<T>,
}

impl<T> PagedResults<T> {
    pub fn from_items(items: Vec<T>, page: PageRequest) -> Self {
        let total = items.len() as u64;
        let size = page.page_size.max(1);
        let page_count = total.div_ceil(size).max(1);
        let number = page.page_number.max(1).min(page_count);
        let start = ((number - 1) * size) as usize;
        let objects = items
            .into_iter()
            .skip(start)
            .take(size as usize)
            .collect();
        PagedResults {
            total_rows: total,
            page_count,
            page_number: number,
            page_size: size,
            objects,
        }
    }
}

/// A known user of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub distinguished_name: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_objects: u64,
    pub total_revisions: u64,
    pub total_content_size: i64,
}

/// Persistence of object metadata, permissions, revisions, and parentage.
///
/// Updates are serialized per object through the change-token precondition:
/// a stale token fails with [`StoreError::Precondition`] and nothing is
/// written. Every successful update strictly increases `change_count`,
/// regenerates `change_token`, and records a revision snapshot.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_object(&self, object: DriveObject) -> Result<DriveObject, StoreError>;

    async fn get_object(&self, id: ObjectId) -> Result<DriveObject, StoreError>;

    async fn update_object(
        &self,
        object: DriveObject,
        expected_token: &str,
    ) -> Result<DriveObject, StoreError>;

    /// Soft delete: the object moves to the trash and descendants become
    /// unreachable until restored.
    async fn delete_object(&self, id: ObjectId) -> Result<DriveObject, StoreError>;

    async fn undelete_object(&self, id: ObjectId) -> Result<DriveObject, StoreError>;

    /// Irreversible removal. Expunged implies deleted.
    async fn expunge_object(&self, id: ObjectId) -> Result<DriveObject, StoreError>;

    async fn get_children(
        &self,
        parent: ObjectId,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    /// Root objects owned by the given resource
    async fn get_root_objects(
        &self,
        owner: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    /// Root objects owned by a group, matched on flattened grantee
    async fn get_root_objects_by_group(
        &self,
        group_grantee: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    async fn get_trashed_objects(
        &self,
        dn: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    async fn get_objects_shared_to_me(
        &self,
        dn: &str,
        groups: &[String],
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    async fn get_objects_i_have_shared(
        &self,
        dn: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    async fn get_objects_shared_to_everyone(
        &self,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    /// Name and description substring search over reachable objects
    async fn search(
        &self,
        phrase: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError>;

    async fn get_revisions(
        &self,
        id: ObjectId,
        page: PageRequest,
    ) -> Result<PagedResults<Revision>, StoreError>;

    async fn get_revision(&self, id: ObjectId, change_count: i64)
        -> Result<Revision, StoreError>;

    /// The ancestry chain of an object, nearest parent first. Walks are
    /// depth-capped to defend against malformed data.
    async fn get_parents(&self, id: ObjectId) -> Result<Vec<DriveObject>, StoreError>;

    async fn get_or_create_user(&self, dn: &str) -> Result<UserRecord, StoreError>;

    async fn user_stats(&self, dn: &str) -> Result<UserStats, StoreError>;

    /// Expunge every trashed object owned by the user, page by page.
    /// Returns the number of objects expunged.
    async fn empty_trash(&self, dn: &str, page_size: u64) -> Result<u64, StoreError>;
}

/// Depth cap for ancestry walks
pub const MAX_ANCESTRY_DEPTH: usize = 512;

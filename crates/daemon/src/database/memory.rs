use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use common::models::{
    flatten, new_change_token, DriveObject, ObjectId, Resource, Revision, EVERYONE_GROUP,
};

use super::{
    ObjectStore, PageRequest, PagedResults, StoreError, UserRecord, UserStats,
    MAX_ANCESTRY_DEPTH,
};

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, DriveObject>,
    revisions: HashMap<ObjectId, Vec<Revision>>,
    users: HashMap<String, UserRecord>,
}

/// In-memory object store used by tests and single-node deployments.
/// Filtering and ordering mirror what the SQL layer provides in production.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: RwLock<Inner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn assign_permission_ids(object: &mut DriveObject) {
    for permission in object.permissions.iter_mut() {
        if permission.id.is_none() {
            permission.id = Some(ObjectId::generate());
        }
    }
}

/// Reachable for listings: not trashed and no trashed ancestor
fn reachable(object: &DriveObject) -> bool {
    !object.is_deleted && !object.is_ancestor_deleted && !object.is_expunged
}

fn owner_matches(object: &DriveObject, owner: &str) -> bool {
    object.owned_by.eq_ignore_ascii_case(owner)
}

fn owned_by_user(object: &DriveObject, dn: &str) -> bool {
    match Resource::parse(&object.owned_by) {
        Ok(Resource::User { dn: owner_dn }) => flatten(&owner_dn) == flatten(dn),
        _ => false,
    }
}

impl Inner {
    fn ancestor_deleted(&self, object: &DriveObject) -> bool {
        let mut current = object.parent_id;
        let mut depth = 0;
        while let Some(parent_id) = current {
            if depth >= MAX_ANCESTRY_DEPTH {
                return false;
            }
            match self.objects.get(&parent_id) {
                Some(parent) => {
                    if parent.is_deleted {
                        return true;
                    }
                    current = parent.parent_id;
                }
                None => return false,
            }
            depth += 1;
        }
        false
    }

    /// Recompute the ancestor-deleted flag across every descendant of `root`
    fn cascade_ancestor_flags(&mut self, root: ObjectId) {
        let descendants: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|o| self.is_descendant_of(o, root))
            .map(|o| o.id)
            .collect();
        for id in descendants {
            let flag = {
                let object = self.objects.get(&id).expect("descendant present");
                self.ancestor_deleted(object)
            };
            if let Some(object) = self.objects.get_mut(&id) {
                object.is_ancestor_deleted = flag;
            }
        }
    }

    fn is_descendant_of(&self, object: &DriveObject, root: ObjectId) -> bool {
        let mut current = object.parent_id;
        let mut depth = 0;
        while let Some(parent_id) = current {
            if parent_id == root {
                return true;
            }
            if depth >= MAX_ANCESTRY_DEPTH {
                return false;
            }
            current = self.objects.get(&parent_id).and_then(|p| p.parent_id);
            depth += 1;
        }
        false
    }

    fn record_revision(&mut self, object: &DriveObject) {
        self.revisions
            .entry(object.id)
            .or_default()
            .push(Revision::from_object(object));
    }
}

fn by_name(items: &mut [DriveObject]) {
    items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
}

fn by_modified_desc(items: &mut [DriveObject]) {
    items.sort_by(|a, b| b.modified_date.cmp(&a.modified_date));
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_object(&self, mut object: DriveObject) -> Result<DriveObject, StoreError> {
        let mut inner = self.inner.write();
        if inner.objects.contains_key(&object.id) {
            return Err(StoreError::Internal(anyhow!(
                "object {} already exists",
                object.id
            )));
        }
        assign_permission_ids(&mut object);
        object.is_ancestor_deleted = inner.ancestor_deleted(&object);
        inner.objects.insert(object.id, object.clone());
        inner.record_revision(&object);
        Ok(object)
    }

    async fn get_object(&self, id: ObjectId) -> Result<DriveObject, StoreError> {
        self.inner
            .read()
            .objects
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_object(
        &self,
        mut object: DriveObject,
        expected_token: &str,
    ) -> Result<DriveObject, StoreError> {
        let mut inner = self.inner.write();
        let current = inner.objects.get(&object.id).ok_or(StoreError::NotFound)?;
        if current.change_token != expected_token {
            return Err(StoreError::Precondition(
                "the change token does not match the current object state".to_string(),
            ));
        }
        object.change_count = current.change_count + 1;
        object.change_token = new_change_token();
        object.modified_date = Utc::now();
        assign_permission_ids(&mut object);
        object.is_ancestor_deleted = inner.ancestor_deleted(&object);
        inner.objects.insert(object.id, object.clone());
        inner.record_revision(&object);
        inner.cascade_ancestor_flags(object.id);
        Ok(object)
    }

    async fn delete_object(&self, id: ObjectId) -> Result<DriveObject, StoreError> {
        let mut inner = self.inner.write();
        let object = inner.objects.get_mut(&id).ok_or(StoreError::NotFound)?;
        object.is_deleted = true;
        object.change_count += 1;
        object.change_token = new_change_token();
        object.modified_date = Utc::now();
        let object = object.clone();
        inner.cascade_ancestor_flags(id);
        Ok(object)
    }

    async fn undelete_object(&self, id: ObjectId) -> Result<DriveObject, StoreError> {
        let mut inner = self.inner.write();
        let object = inner.objects.get_mut(&id).ok_or(StoreError::NotFound)?;
        object.is_deleted = false;
        object.change_count += 1;
        object.change_token = new_change_token();
        object.modified_date = Utc::now();
        let object = object.clone();
        inner.cascade_ancestor_flags(id);
        Ok(object)
    }

    async fn expunge_object(&self, id: ObjectId) -> Result<DriveObject, StoreError> {
        let mut inner = self.inner.write();
        let object = inner.objects.get_mut(&id).ok_or(StoreError::NotFound)?;
        object.is_deleted = true;
        object.is_expunged = true;
        object.change_count += 1;
        object.change_token = new_change_token();
        object.modified_date = Utc::now();
        let object = object.clone();
        inner.cascade_ancestor_flags(id);
        Ok(object)
    }

    async fn get_children(
        &self,
        parent: ObjectId,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| o.parent_id == Some(parent) && reachable(o))
            .cloned()
            .collect();
        by_name(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_root_objects(
        &self,
        owner: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| o.parent_id.is_none() && reachable(o) && owner_matches(o, owner))
            .cloned()
            .collect();
        by_name(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_root_objects_by_group(
        &self,
        group_grantee: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let wanted = flatten(group_grantee);
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| {
                o.parent_id.is_none()
                    && reachable(o)
                    && Resource::parse(&o.owned_by)
                        .map(|r| !r.is_user() && flatten(&r.grantee()) == wanted)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        by_name(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_trashed_objects(
        &self,
        dn: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| {
                o.is_deleted && !o.is_expunged && !o.is_ancestor_deleted && owned_by_user(o, dn)
            })
            .cloned()
            .collect();
        by_modified_desc(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_objects_shared_to_me(
        &self,
        dn: &str,
        groups: &[String],
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let me = flatten(dn);
        let everyone = flatten(EVERYONE_GROUP);
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| reachable(o) && !owned_by_user(o, dn))
            .filter(|o| {
                o.permissions.iter().any(|p| {
                    let grantee = flatten(&p.grantee);
                    !p.is_deleted
                        && p.allow_read
                        && grantee != everyone
                        && (grantee == me || groups.iter().any(|g| flatten(g) == grantee))
                })
            })
            .cloned()
            .collect();
        by_modified_desc(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_objects_i_have_shared(
        &self,
        dn: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let me = flatten(dn);
        let everyone = flatten(EVERYONE_GROUP);
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| reachable(o) && owned_by_user(o, dn))
            .filter(|o| {
                o.permissions.iter().any(|p| {
                    let grantee = flatten(&p.grantee);
                    !p.is_deleted && p.allow_read && grantee != everyone && grantee != me
                })
            })
            .cloned()
            .collect();
        by_modified_desc(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_objects_shared_to_everyone(
        &self,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| reachable(o))
            .filter(|o| {
                o.permissions
                    .iter()
                    .any(|p| !p.is_deleted && p.allow_read && p.is_for(EVERYONE_GROUP))
            })
            .cloned()
            .collect();
        by_modified_desc(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn search(
        &self,
        phrase: &str,
        page: PageRequest,
    ) -> Result<PagedResults<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let phrase = phrase.to_lowercase();
        let mut items: Vec<DriveObject> = inner
            .objects
            .values()
            .filter(|o| reachable(o))
            .filter(|o| {
                o.name.to_lowercase().contains(&phrase)
                    || o.description.to_lowercase().contains(&phrase)
            })
            .cloned()
            .collect();
        by_modified_desc(&mut items);
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_revisions(
        &self,
        id: ObjectId,
        page: PageRequest,
    ) -> Result<PagedResults<Revision>, StoreError> {
        let inner = self.inner.read();
        if !inner.objects.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let mut items = inner.revisions.get(&id).cloned().unwrap_or_default();
        items.sort_by(|a, b| b.change_count.cmp(&a.change_count));
        Ok(PagedResults::from_items(items, page))
    }

    async fn get_revision(
        &self,
        id: ObjectId,
        change_count: i64,
    ) -> Result<Revision, StoreError> {
        self.inner
            .read()
            .revisions
            .get(&id)
            .and_then(|revisions| {
                revisions
                    .iter()
                    .find(|r| r.change_count == change_count)
                    .cloned()
            })
            .ok_or(StoreError::NotFound)
    }

    async fn get_parents(&self, id: ObjectId) -> Result<Vec<DriveObject>, StoreError> {
        let inner = self.inner.read();
        let object = inner.objects.get(&id).ok_or(StoreError::NotFound)?;
        let mut chain = Vec::new();
        let mut current = object.parent_id;
        while let Some(parent_id) = current {
            if chain.len() >= MAX_ANCESTRY_DEPTH {
                return Err(StoreError::Internal(anyhow!(
                    "ancestry depth cap exceeded for {}",
                    id
                )));
            }
            match inner.objects.get(&parent_id) {
                Some(parent) => {
                    chain.push(parent.clone());
                    current = parent.parent_id;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    async fn get_or_create_user(&self, dn: &str) -> Result<UserRecord, StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .users
            .entry(flatten(dn))
            .or_insert_with(|| UserRecord {
                distinguished_name: dn.to_string(),
                created_date: Utc::now(),
            });
        Ok(record.clone())
    }

    async fn user_stats(&self, dn: &str) -> Result<UserStats, StoreError> {
        let inner = self.inner.read();
        let mut stats = UserStats::default();
        for object in inner.objects.values() {
            if owned_by_user(object, dn) && !object.is_expunged {
                stats.total_objects += 1;
                stats.total_content_size += object.content_size;
                stats.total_revisions += inner
                    .revisions
                    .get(&object.id)
                    .map(|r| r.len() as u64)
                    .unwrap_or(0);
            }
        }
        Ok(stats)
    }

    async fn empty_trash(&self, dn: &str, page_size: u64) -> Result<u64, StoreError> {
        let mut expunged = 0u64;
        loop {
            let batch = self
                .get_trashed_objects(
                    dn,
                    PageRequest {
                        page_number: 1,
                        page_size: page_size.max(1),
                    },
                )
                .await?;
            if batch.objects.is_empty() {
                return Ok(expunged);
            }
            for object in batch.objects {
                self.expunge_object(object.id).await?;
                expunged += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::acm::AcmDocument;

    const DN: &str = "cn=test tester10";

    fn store() -> MemoryObjectStore {
        MemoryObjectStore::new()
    }

    fn object(name: &str) -> DriveObject {
        let acm = AcmDocument::parse(r#"{"classif":"U"}"#).unwrap();
        DriveObject::new(name, "File", format!("user/{}", DN), acm, DN)
    }

    #[tokio::test]
    async fn test_update_requires_matching_token() {
        let store = store();
        let created = store.create_object(object("a")).await.unwrap();

        let mut renamed = created.clone();
        renamed.name = "b".to_string();
        let err = store.update_object(renamed.clone(), "stale").await;
        assert!(matches!(err, Err(StoreError::Precondition(_))));

        let updated = store
            .update_object(renamed, &created.change_token)
            .await
            .unwrap();
        assert_eq!(updated.change_count, created.change_count + 1);
        assert_ne!(updated.change_token, created.change_token);
    }

    #[tokio::test]
    async fn test_revisions_record_history() {
        let store = store();
        let created = store.create_object(object("a")).await.unwrap();
        let mut renamed = created.clone();
        renamed.name = "b".to_string();
        store
            .update_object(renamed, &created.change_token)
            .await
            .unwrap();

        let revisions = store
            .get_revisions(created.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(revisions.total_rows, 2);
        assert_eq!(revisions.objects[0].name, "b");
        assert_eq!(revisions.objects[1].name, "a");
    }

    #[tokio::test]
    async fn test_delete_cascades_ancestor_flag() {
        let store = store();
        let parent = store.create_object(object("folder")).await.unwrap();
        let mut child = object("doc");
        child.parent_id = Some(parent.id);
        let child = store.create_object(child).await.unwrap();

        store.delete_object(parent.id).await.unwrap();
        let child_now = store.get_object(child.id).await.unwrap();
        assert!(child_now.is_ancestor_deleted);
        assert!(!child_now.is_deleted);

        store.undelete_object(parent.id).await.unwrap();
        let child_now = store.get_object(child.id).await.unwrap();
        assert!(!child_now.is_ancestor_deleted);
    }

    #[tokio::test]
    async fn test_trash_lists_only_explicitly_deleted(){
        let store = store();
        let parent = store.create_object(object("folder")).await.unwrap();
        let mut child = object("doc");
        child.parent_id = Some(parent.id);
        store.create_object(child).await.unwrap();
        store.delete_object(parent.id).await.unwrap();

        let trashed = store
            .get_trashed_objects(DN, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(trashed.total_rows, 1);
        assert_eq!(trashed.objects[0].name, "folder");
    }

    #[tokio::test]
    async fn test_empty_trash_expunges_everything() {
        let store = store();
        for name in ["a", "b", "c"] {
            let created = store.create_object(object(name)).await.unwrap();
            store.delete_object(created.id).await.unwrap();
        }
        let count = store.empty_trash(DN, 2).await.unwrap();
        assert_eq!(count, 3);
        let trashed = store
            .get_trashed_objects(DN, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(trashed.total_rows, 0);
    }

    #[tokio::test]
    async fn test_paging() {
        let store = store();
        for i in 0..25 {
            store
                .create_object(object(&format!("obj-{:02}", i)))
                .await
                .unwrap();
        }
        let page = store
            .get_root_objects(
                &format!("user/{}", DN),
                PageRequest {
                    page_number: 2,
                    page_size: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total_rows, 25);
        assert_eq!(page.page_count, 3);
        assert_eq!(page.objects.len(), 10);
        assert_eq!(page.objects[0].name, "obj-10");
    }
}

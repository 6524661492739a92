//! The permission engine
//!
//! Merges, consolidates, and reduces capability grants, and reconciles the
//! permission list with the ACM `share` on every mutation. All grantee
//! comparisons go through [`flatten`]; permissions whose MAC does not verify
//! are skipped during authorization and never elevated.

use serde_json::Value;

use crate::acm::AcmError;
use crate::crypto::{MasterKey, KEY_SIZE};
use crate::models::{
    flatten, DriveObject, Permission, Resource, ResourceError, EVERYONE_GROUP,
};

/// Errors raised while reconciling permissions with the ACM
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("owner resource is invalid: {0}")]
    InvalidOwner(#[from] ResourceError),
    #[error("owner may not be the everyone group")]
    EveryoneOwner,
    #[error("acm error: {0}")]
    Acm(#[from] AcmError),
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// A set of required or held capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
    pub share: bool,
}

impl Caps {
    pub fn read_only() -> Self {
        Caps {
            read: true,
            ..Default::default()
        }
    }

    pub fn full() -> Self {
        Caps {
            create: true,
            read: true,
            update: true,
            delete: true,
            share: true,
        }
    }

    pub fn of(permission: &Permission) -> Self {
        Caps {
            create: permission.allow_create,
            read: permission.allow_read,
            update: permission.allow_update,
            delete: permission.allow_delete,
            share: permission.allow_share,
        }
    }

    pub fn union(self, other: Caps) -> Caps {
        Caps {
            create: self.create || other.create,
            read: self.read || other.read,
            update: self.update || other.update,
            delete: self.delete || other.delete,
            share: self.share || other.share,
        }
    }

    /// True when `self` covers everything `required` asks for
    pub fn covers(self, required: Caps) -> bool {
        (!required.create || self.create)
            && (!required.read || self.read)
            && (!required.update || self.update)
            && (!required.delete || self.delete)
            && (!required.share || self.share)
    }

    pub fn intersects(self, other: Caps) -> bool {
        (other.create && self.create)
            || (other.read && self.read)
            || (other.update && self.update)
            || (other.delete && self.delete)
            || (other.share && self.share)
    }
}

/// Whether a permission applies to the given caller identity
fn grantee_matches(permission: &Permission, dn: &str, groups: &[String]) -> bool {
    let grantee = flatten(&permission.grantee);
    if grantee == flatten(dn) || grantee == flatten(EVERYONE_GROUP) {
        return true;
    }
    if permission.grantee.eq_ignore_ascii_case(dn) {
        return true;
    }
    if let Some(group_name) = &permission.acm_grantee.group_name {
        if group_name.eq_ignore_ascii_case(EVERYONE_GROUP) {
            return true;
        }
    }
    groups.iter().any(|g| flatten(g) == grantee)
}

/// Combine the caller's live grants into a single rollup permission.
///
/// Returns whether the required capabilities are met and, when they are, the
/// synthesized union permission carrying a freshly computed MAC. Permissions
/// with invalid MACs are logged and skipped.
pub fn rollup(
    master: &MasterKey,
    dn: &str,
    groups: &[String],
    permissions: &[Permission],
    required: Caps,
) -> (bool, Option<Permission>) {
    let mut combined: Option<Permission> = None;
    let mut authorized = false;

    for permission in permissions.iter().filter(|p| !p.is_deleted) {
        if !grantee_matches(permission, dn, groups) {
            continue;
        }
        if !permission.mac_verifies(master) {
            tracing::warn!(
                grantee = %permission.grantee,
                "invalid mac on permission, skipping"
            );
            continue;
        }
        if !Caps::of(permission).intersects(required) {
            continue;
        }

        match combined.as_mut() {
            None => combined = Some(permission.clone()),
            Some(acc) => {
                acc.allow_create |= permission.allow_create;
                acc.allow_read |= permission.allow_read;
                acc.allow_update |= permission.allow_update;
                acc.allow_delete |= permission.allow_delete;
                acc.allow_share |= permission.allow_share;
            }
        }

        let held = Caps::of(combined.as_ref().expect("combined set"));
        if held.covers(required) {
            authorized = true;
            if held.covers(Caps::full()) {
                break;
            }
        }
    }

    if let Some(acc) = combined.as_mut() {
        acc.permission_mac = acc.calculate_mac(master);
    }
    (authorized, combined)
}

/// Collapse multiple still-creating permissions with an identical grantee
/// into one by OR-ing their capability bits.
pub fn consolidate(permissions: &mut Vec<Permission>, master: &MasterKey) {
    let mut index = 0;
    while index < permissions.len() {
        if permissions[index].is_deleted || !permissions[index].is_creating() {
            index += 1;
            continue;
        }
        let grantee = flatten(&permissions[index].grantee);
        let mut merged = false;
        let mut scan = index + 1;
        while scan < permissions.len() {
            let duplicate = !permissions[scan].is_deleted
                && permissions[scan].is_creating()
                && flatten(&permissions[scan].grantee) == grantee;
            if duplicate {
                let other = permissions.remove(scan);
                let keep = &mut permissions[index];
                keep.allow_create |= other.allow_create;
                keep.allow_read |= other.allow_read;
                keep.allow_update |= other.allow_update;
                keep.allow_delete |= other.allow_delete;
                keep.allow_share |= other.allow_share;
                merged = true;
            } else {
                scan += 1;
            }
        }
        if merged {
            let keep = &mut permissions[index];
            keep.permission_mac = keep.calculate_mac(master);
        }
        index += 1;
    }
}

/// True when `candidate` grants nothing beyond the union of live grants
/// already held for the same grantee or for everyone.
pub fn reduce_grants(existing: &[Permission], candidate: &Permission) -> bool {
    let grantee = flatten(&candidate.grantee);
    let mut held = Caps::default();
    for permission in existing.iter().filter(|p| !p.is_deleted) {
        let existing_grantee = flatten(&permission.grantee);
        if existing_grantee == grantee || existing_grantee == flatten(EVERYONE_GROUP) {
            held = held.union(Caps::of(permission));
        }
    }
    held.covers(Caps::of(candidate))
}

/// Inject live read grants into the ACM `share`: every non-everyone read
/// permission whose grantee is missing from the share gets its fragment
/// merged in.
pub fn inject_permissions_into_acm(object: &mut DriveObject) {
    let in_share: Vec<String> = object
        .raw_acm
        .share_resources()
        .iter()
        .map(Resource::grantee)
        .collect();
    let fragments: Vec<(String, Value)> = object
        .permissions
        .iter()
        .filter(|p| !p.is_deleted && p.allow_read && !p.is_for(EVERYONE_GROUP))
        .filter(|p| !in_share.iter().any(|g| flatten(g) == flatten(&p.grantee)))
        .filter_map(|p| {
            let fragment = share_fragment_of(p)?;
            Some((p.grantee.clone(), fragment))
        })
        .collect();
    for (grantee, fragment) in fragments {
        object.raw_acm.add_share_fragment(&fragment);
        object.raw_acm.add_f_share(&grantee);
    }
}

/// Reset the ACM `share` to exactly the union of live non-everyone read
/// grantees' share fragments, preserving every other ACM field.
pub fn rebuild_acm_from_permissions(object: &mut DriveObject) {
    object.raw_acm.clear_share();
    let fragments: Vec<(String, Value)> = object
        .permissions
        .iter()
        .filter(|p| !p.is_deleted && p.allow_read && !p.is_for(EVERYONE_GROUP))
        .filter_map(|p| Some((p.grantee.clone(), share_fragment_of(p)?)))
        .collect();
    for (grantee, fragment) in fragments {
        object.raw_acm.add_share_fragment(&fragment);
        object.raw_acm.add_f_share(&grantee);
    }
}

fn share_fragment_of(permission: &Permission) -> Option<Value> {
    if !permission.acm_share.is_null() {
        return Some(permission.acm_share.clone());
    }
    permission
        .acm_grantee
        .resource()
        .ok()
        .and_then(|r| r.acm_share_fragment())
}

/// Reconcile the permission list with the ACM `share`.
///
/// The owner always ends up with a live create/update/delete/share grant;
/// read access is driven entirely by the share: an empty share maps to a
/// single everyone read grant, a populated share maps to exactly one read
/// grant per named grantee.
pub fn normalize_read_permissions(
    object: &mut DriveObject,
    master: &MasterKey,
) -> Result<(), PermissionError> {
    let acm_says_everyone = object.raw_acm.share_is_everyone();

    // File key recovered from any live valid grant; folders and other
    // streamless objects have none.
    let source_key: Option<[u8; KEY_SIZE]> = object
        .permissions
        .iter()
        .find(|p| !p.is_deleted && p.encrypt_key.len() == KEY_SIZE && p.mac_verifies(master))
        .map(|p| p.file_key(master))
        .transpose()?;

    let has_everyone = object
        .live_permissions()
        .any(|p| p.allow_read && p.is_for(EVERYONE_GROUP));

    // Force owner create/update/delete/share
    let owner = Resource::parse(&object.owned_by)?;
    if owner.is_everyone() {
        return Err(PermissionError::EveryoneOwner);
    }
    let owner_grantee = owner.grantee();
    let owner_ok = object.live_permissions().any(|p| {
        p.is_for(&owner_grantee)
            && p.allow_create
            && p.allow_update
            && p.allow_delete
            && p.allow_share
    });
    if !owner_ok {
        let mut synthesized = Permission::for_resource(&owner, true, true, true, true, true);
        apply_key(&mut synthesized, master, &source_key)?;
        if !acm_says_everyone {
            if let Some(fragment) = owner.acm_share_fragment() {
                object.raw_acm.add_share_fragment(&fragment);
                object.raw_acm.add_f_share(&owner_grantee);
            }
        }
        object.permissions.push(synthesized);
    }

    if has_everyone && !acm_says_everyone {
        // The share names specific grantees; drop the everyone read grants
        retain_or_delete(&mut object.permissions, |p| {
            !(p.allow_read && p.is_for(EVERYONE_GROUP))
        });
    }

    if acm_says_everyone {
        if !has_everyone {
            let mut everyone = Permission::for_everyone_read();
            apply_key(&mut everyone, master, &source_key)?;
            object.permissions.push(everyone);
        }
        // Everyone already reads; strip read from specific grants. Grants
        // that carry other capabilities survive as explicit shares.
        strip_read(object, master, |p| !p.is_for(EVERYONE_GROUP))?;
    } else {
        let required: Vec<Resource> = object.raw_acm.share_resources();
        for resource in &required {
            let grantee = resource.grantee();
            let present = object
                .live_permissions()
                .any(|p| p.allow_read && p.is_for(&grantee));
            if !present {
                let mut read = Permission::for_resource(resource, false, true, false, false, false);
                apply_key(&mut read, master, &source_key)?;
                object.permissions.push(read);
            }
        }
        let required_grantees: Vec<String> =
            required.iter().map(|r| flatten(&r.grantee())).collect();
        strip_read(object, master, move |p| {
            !p.is_for(EVERYONE_GROUP) && !required_grantees.contains(&flatten(&p.grantee))
        })?;
    }

    // Drop grants that no longer grant anything
    retain_or_delete(&mut object.permissions, Permission::grants_anything);

    Ok(())
}

fn apply_key(
    permission: &mut Permission,
    master: &MasterKey,
    source_key: &Option<[u8; KEY_SIZE]>,
) -> Result<(), PermissionError> {
    match source_key {
        Some(key) => permission.set_encrypt_key(master, key)?,
        None => permission.permission_mac = permission.calculate_mac(master),
    }
    Ok(())
}

/// Remove read capability from live permissions selected by `select`.
/// Read-only grants are removed outright (or marked deleted once persisted);
/// grants carrying other capabilities are rewritten with `allow_read` off and
/// `explicit_share` set, with their key re-wrapped and MAC recomputed.
fn strip_read<F>(
    object: &mut DriveObject,
    master: &MasterKey,
    select: F,
) -> Result<(), PermissionError>
where
    F: Fn(&Permission) -> bool,
{
    for permission in object.permissions.iter_mut() {
        if permission.is_deleted || !permission.allow_read || !select(permission) {
            continue;
        }
        let read_only = !(permission.allow_create
            || permission.allow_update
            || permission.allow_delete
            || permission.allow_share);
        if read_only {
            permission.is_deleted = true;
        } else {
            permission.allow_read = false;
            permission.explicit_share = true;
            permission.permission_mac = permission.calculate_mac(master);
        }
    }
    // Creating read-only grants never persisted; drop them entirely
    object
        .permissions
        .retain(|p| !(p.is_deleted && p.is_creating()));
    Ok(())
}

/// Mark persisted permissions deleted and drop still-creating ones when they
/// fail the predicate.
fn retain_or_delete<F>(permissions: &mut Vec<Permission>, keep: F)
where
    F: Fn(&Permission) -> bool,
{
    for permission in permissions.iter_mut() {
        if !permission.is_deleted && !keep(permission) {
            permission.is_deleted = true;
        }
    }
    permissions.retain(|p| !(p.is_deleted && p.is_creating()));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acm::AcmDocument;
    use crate::crypto;

    const OWNER_DN: &str = "cn=test tester10,ou=people,o=u.s. project,c=us";

    fn master() -> MasterKey {
        MasterKey::new("engine test key").unwrap()
    }

    fn object_with_acm(raw: &str) -> DriveObject {
        let acm = AcmDocument::parse(raw).unwrap();
        let mut obj = DriveObject::new(
            "doc",
            "File",
            format!("user/{}", OWNER_DN),
            acm,
            OWNER_DN,
        );
        obj.content_size = 42;
        obj
    }

    fn keyed(mut permission: Permission, m: &MasterKey, key: &[u8; 32]) -> Permission {
        permission.set_encrypt_key(m, key).unwrap();
        permission
    }

    #[test]
    fn test_normalize_empty_share_yields_everyone_only() {
        let m = master();
        let key = crypto::create_key();
        let mut obj = object_with_acm(r#"{"classif":"U"}"#);
        // Explicit read grant for a user; the empty share must win
        obj.permissions.push(keyed(
            Permission::for_user("cn=somebody else", false, true, false, false, false),
            &m,
            &key,
        ));

        normalize_read_permissions(&mut obj, &m).unwrap();

        let readers: Vec<_> = obj
            .live_permissions()
            .filter(|p| p.allow_read)
            .collect();
        assert_eq!(readers.len(), 1);
        assert!(readers[0].is_for(EVERYONE_GROUP));
        // Owner holds CUDS without read
        let owner = obj
            .live_permissions()
            .find(|p| p.is_for(&Resource::user(OWNER_DN).grantee()))
            .expect("owner grant");
        assert!(owner.allow_create && owner.allow_update && owner.allow_delete && owner.allow_share);
        assert!(!owner.allow_read);
        assert!(owner.mac_verifies(&m));
    }

    #[test]
    fn test_normalize_named_share_grants_each_grantee() {
        let m = master();
        let mut obj = object_with_acm(
            r#"{"classif":"U","share":{"users":["cn=alpha"],"projects":{"dctc":{"groups":["watchers"]}}}}"#,
        );

        normalize_read_permissions(&mut obj, &m).unwrap();

        assert!(obj
            .live_permissions()
            .any(|p| p.allow_read && p.is_for(&Resource::user("cn=alpha").grantee())));
        assert!(obj
            .live_permissions()
            .any(|p| p.allow_read && p.is_for("dctc_watchers")));
        assert!(!obj
            .live_permissions()
            .any(|p| p.allow_read && p.is_for(EVERYONE_GROUP)));
        // Owner entered the share with full caps
        let owner = obj
            .live_permissions()
            .find(|p| p.is_for(&Resource::user(OWNER_DN).grantee()))
            .expect("owner grant");
        assert!(owner.allow_read);
        assert!(obj
            .raw_acm
            .share_resources()
            .contains(&Resource::user(OWNER_DN)));
    }

    #[test]
    fn test_normalize_drops_stale_read_grants() {
        let m = master();
        let key = crypto::create_key();
        let mut obj = object_with_acm(r#"{"classif":"U","share":{"users":["cn=alpha"]}}"#);
        let mut stale = keyed(
            Permission::for_user("cn=stale", false, true, false, false, false),
            &m,
            &key,
        );
        stale.id = Some(crate::models::ObjectId::generate());
        obj.permissions.push(stale);

        normalize_read_permissions(&mut obj, &m).unwrap();

        let stale_grantee = Resource::user("cn=stale").grantee();
        assert!(!obj
            .live_permissions()
            .any(|p| p.allow_read && p.is_for(&stale_grantee)));
        // Persisted grant is retained as a deletion marker
        assert!(obj
            .permissions
            .iter()
            .any(|p| p.is_deleted && p.is_for(&stale_grantee)));
    }

    #[test]
    fn test_normalize_converts_updater_to_explicit_share() {
        let m = master();
        let key = crypto::create_key();
        let mut obj = object_with_acm(r#"{"classif":"U"}"#);
        let mut editor = keyed(
            Permission::for_user("cn=editor", false, true, true, false, false),
            &m,
            &key,
        );
        editor.id = Some(crate::models::ObjectId::generate());
        obj.permissions.push(editor);

        normalize_read_permissions(&mut obj, &m).unwrap();

        let editor_grantee = Resource::user("cn=editor").grantee();
        let kept = obj
            .live_permissions()
            .find(|p| p.is_for(&editor_grantee))
            .expect("editor grant survives");
        assert!(!kept.allow_read);
        assert!(kept.allow_update);
        assert!(kept.explicit_share);
        assert!(kept.mac_verifies(&m));
    }

    #[test]
    fn test_normalize_is_stable() {
        let m = master();
        let mut obj = object_with_acm(r#"{"classif":"U","share":{"users":["cn=alpha"]}}"#);
        normalize_read_permissions(&mut obj, &m).unwrap();
        let first = obj.permissions.clone();
        normalize_read_permissions(&mut obj, &m).unwrap();
        assert_eq!(first.len(), obj.permissions.len());
    }

    #[test]
    fn test_rollup_combines_across_grants() {
        let m = master();
        let key = crypto::create_key();
        let perms = vec![
            keyed(
                Permission::for_user("cn=worker", false, true, false, false, false),
                &m,
                &key,
            ),
            keyed(
                Permission::for_user("cn=worker", false, false, true, false, false),
                &m,
                &key,
            ),
        ];
        let required = Caps {
            read: true,
            update: true,
            ..Default::default()
        };
        let (ok, combined) = rollup(&m, "cn=worker", &[], &perms, required);
        assert!(ok);
        let combined = combined.unwrap();
        assert!(combined.allow_read && combined.allow_update);
        assert!(combined.mac_verifies(&m));
    }

    #[test]
    fn test_rollup_skips_invalid_mac() {
        let m = master();
        let key = crypto::create_key();
        let mut forged = keyed(
            Permission::for_user("cn=worker", false, true, false, false, false),
            &m,
            &key,
        );
        forged.allow_update = true; // breaks the MAC
        let (ok, _) = rollup(
            &m,
            "cn=worker",
            &[],
            &[forged],
            Caps {
                update: true,
                ..Default::default()
            },
        );
        assert!(!ok);
    }

    #[test]
    fn test_rollup_matches_groups_and_everyone() {
        let m = master();
        let key = crypto::create_key();
        let perms = vec![
            keyed(Permission::for_everyone_read(), &m, &key),
            keyed(
                Permission::for_resource(
                    &Resource::group("dctc", "watchers"),
                    false,
                    false,
                    true,
                    false,
                    false,
                ),
                &m,
                &key,
            ),
        ];
        let groups = vec!["dctc_watchers".to_string()];
        let (ok, combined) = rollup(
            &m,
            "cn=anyone",
            &groups,
            &perms,
            Caps {
                read: true,
                update: true,
                ..Default::default()
            },
        );
        assert!(ok);
        assert!(combined.unwrap().allow_update);
    }

    #[test]
    fn test_consolidate_merges_creating_duplicates() {
        let m = master();
        let mut perms = vec![
            Permission::for_user("cn=dup", true, false, false, false, false),
            Permission::for_user("cn=dup", false, true, false, false, false),
            Permission::for_user("cn=other", false, true, false, false, false),
        ];
        consolidate(&mut perms, &m);
        assert_eq!(perms.len(), 2);
        assert!(perms[0].allow_create && perms[0].allow_read);
    }

    #[test]
    fn test_reduce_grants_detects_redundant_candidate() {
        let m = master();
        let key = crypto::create_key();
        let existing = vec![
            keyed(Permission::for_everyone_read(), &m, &key),
            keyed(
                Permission::for_user("cn=editor", false, false, true, false, false),
                &m,
                &key,
            ),
        ];
        let redundant = Permission::for_user("cn=editor", false, true, true, false, false);
        assert!(reduce_grants(&existing, &redundant));
        let novel = Permission::for_user("cn=editor", false, false, false, true, false);
        assert!(!reduce_grants(&existing, &novel));
    }

    #[test]
    fn test_inject_and_rebuild_round_trip() {
        let m = master();
        let key = crypto::create_key();
        let mut obj = object_with_acm(r#"{"classif":"U","share":{"users":["cn=alpha"]}}"#);
        obj.permissions.push(keyed(
            Permission::for_user("cn=alpha", false, true, false, false, false),
            &m,
            &key,
        ));
        obj.permissions.push(keyed(
            Permission::for_user("cn=beta", false, true, false, false, false),
            &m,
            &key,
        ));

        inject_permissions_into_acm(&mut obj);
        let injected: Vec<String> = obj
            .raw_acm
            .share_resources()
            .iter()
            .map(Resource::grantee)
            .collect();
        assert!(injected.contains(&Resource::user("cn=beta").grantee()));

        rebuild_acm_from_permissions(&mut obj);
        let rebuilt: Vec<String> = obj
            .raw_acm
            .share_resources()
            .iter()
            .map(Resource::grantee)
            .collect();
        assert_eq!(rebuilt.len(), 2);
        assert!(rebuilt.contains(&Resource::user("cn=alpha").grantee()));
        assert!(rebuilt.contains(&Resource::user("cn=beta").grantee()));
    }

    #[test]
    fn test_everyone_owner_is_rejected() {
        let m = master();
        let acm = AcmDocument::parse(r#"{"classif":"U"}"#).unwrap();
        let mut obj = DriveObject::new("doc", "File", "group/-Everyone", acm, OWNER_DN);
        assert!(matches!(
            normalize_read_permissions(&mut obj, &m),
            Err(PermissionError::EveryoneOwner)
        ));
    }
}

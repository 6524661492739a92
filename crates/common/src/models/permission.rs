use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoError, MasterKey};

use super::object::ObjectId;
use super::resource::{flatten, Resource};

/// Structured form of a permission grantee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmGrantee {
    /// Flattened grantee key, always comparable with [`flatten`]
    pub grantee: String,
    /// Original resource string, `user/<dn>` or `group/...`
    pub resource_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_distinguished_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

impl AcmGrantee {
    pub fn from_resource(resource: &Resource) -> Self {
        match resource {
            Resource::User { dn } => AcmGrantee {
                grantee: resource.grantee(),
                resource_string: resource.to_string(),
                user_distinguished_name: Some(dn.clone()),
                project_name: None,
                project_display_name: None,
                group_name: None,
            },
            Resource::Group {
                project,
                group,
                display,
            } => AcmGrantee {
                grantee: resource.grantee(),
                resource_string: resource.to_string(),
                user_distinguished_name: None,
                project_name: project.clone(),
                project_display_name: display.clone(),
                group_name: Some(group.clone()),
            },
        }
    }

    pub fn resource(&self) -> Result<Resource, super::resource::ResourceError> {
        Resource::parse(&self.resource_string)
    }
}

/// A capability grant attached to one object
///
/// Each permission wraps the per-object file key under its own IV and binds
/// the grantee, the five capability bits, and the wrapped key together with a
/// MAC keyed by the process master key. A permission whose MAC does not
/// verify is skipped during authorization, never elevated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Assigned by the store on persist; `None` while still creating
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub grantee: String,
    pub acm_grantee: AcmGrantee,
    pub allow_create: bool,
    pub allow_read: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub allow_share: bool,
    #[serde(skip)]
    pub encrypt_key: Vec<u8>,
    #[serde(skip)]
    pub permission_iv: Vec<u8>,
    #[serde(skip)]
    pub permission_mac: Vec<u8>,
    #[serde(default)]
    pub is_deleted: bool,
    /// Set when read was stripped in favor of the everyone grant but the
    /// share was requested explicitly
    #[serde(default)]
    pub explicit_share: bool,
    /// ACM `share` fragment contributed by this grant
    #[serde(default)]
    pub acm_share: serde_json::Value,
}

impl Permission {
    pub fn for_resource(
        resource: &Resource,
        allow_create: bool,
        allow_read: bool,
        allow_update: bool,
        allow_delete: bool,
        allow_share: bool,
    ) -> Self {
        let acm_grantee = AcmGrantee::from_resource(resource);
        let acm_share = resource
            .acm_share_fragment()
            .unwrap_or(serde_json::Value::Null);
        Permission {
            id: None,
            grantee: acm_grantee.grantee.clone(),
            acm_grantee,
            allow_create,
            allow_read,
            allow_update,
            allow_delete,
            allow_share,
            encrypt_key: Vec::new(),
            permission_iv: Vec::new(),
            permission_mac: Vec::new(),
            is_deleted: false,
            explicit_share: false,
            acm_share,
        }
    }

    pub fn for_user(
        dn: &str,
        allow_create: bool,
        allow_read: bool,
        allow_update: bool,
        allow_delete: bool,
        allow_share: bool,
    ) -> Self {
        Self::for_resource(
            &Resource::user(dn),
            allow_create,
            allow_read,
            allow_update,
            allow_delete,
            allow_share,
        )
    }

    /// Read-only grant for every authenticated user
    pub fn for_everyone_read() -> Self {
        Self::for_resource(&Resource::everyone(), false, true, false, false, false)
    }

    /// Still creating: not yet assigned an id by the store
    pub fn is_creating(&self) -> bool {
        self.id.is_none()
    }

    pub fn grants_anything(&self) -> bool {
        self.allow_create
            || self.allow_read
            || self.allow_update
            || self.allow_delete
            || self.allow_share
    }

    pub fn is_for(&self, grantee: &str) -> bool {
        flatten(&self.grantee) == flatten(grantee)
    }

    /// Assign a fresh IV, wrap `file_key` under it, and recompute the MAC
    pub fn set_encrypt_key(
        &mut self,
        master: &MasterKey,
        file_key: &[u8],
    ) -> Result<(), CryptoError> {
        self.permission_iv = crypto::create_permission_iv().to_vec();
        self.encrypt_key = crypto::apply_passphrase(master, &self.permission_iv, file_key)?.to_vec();
        self.permission_mac = self.calculate_mac(master);
        Ok(())
    }

    /// Recover the per-object file key wrapped in this permission
    pub fn file_key(&self, master: &MasterKey) -> Result<[u8; 32], CryptoError> {
        crypto::apply_passphrase(master, &self.permission_iv, &self.encrypt_key)
    }

    /// Re-wrap the file key held by `source` under a fresh IV for this
    /// permission, so the grantee can decrypt without the plaintext key ever
    /// being exposed outside the process.
    pub fn copy_encrypt_key(
        &mut self,
        master: &MasterKey,
        source: &Permission,
    ) -> Result<(), CryptoError> {
        let file_key = source.file_key(master)?;
        self.set_encrypt_key(master, &file_key)
    }

    pub fn calculate_mac(&self, master: &MasterKey) -> Vec<u8> {
        crypto::permission_mac(
            master,
            &self.grantee,
            self.allow_create,
            self.allow_read,
            self.allow_update,
            self.allow_delete,
            self.allow_share,
            &self.encrypt_key,
        )
        .to_vec()
    }

    pub fn mac_verifies(&self, master: &MasterKey) -> bool {
        !self.permission_mac.is_empty() && self.permission_mac == self.calculate_mac(master)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn master() -> MasterKey {
        MasterKey::new("test master key").unwrap()
    }

    #[test]
    fn test_mac_round_trip() {
        let mut p = Permission::for_user("cn=test tester10", true, true, true, true, true);
        p.set_encrypt_key(&master(), &crypto::create_key()).unwrap();
        assert!(p.mac_verifies(&master()));
    }

    #[test]
    fn test_mac_breaks_on_capability_change() {
        let mut p = Permission::for_user("cn=test tester10", false, true, false, false, false);
        p.set_encrypt_key(&master(), &crypto::create_key()).unwrap();
        p.allow_share = true;
        assert!(!p.mac_verifies(&master()));
    }

    #[test]
    fn test_copy_encrypt_key_preserves_file_key() {
        let m = master();
        let file_key = crypto::create_key();
        let mut src = Permission::for_user("cn=alpha", true, true, true, true, true);
        src.set_encrypt_key(&m, &file_key).unwrap();

        let mut dst = Permission::for_user("cn=beta", false, true, false, false, false);
        dst.copy_encrypt_key(&m, &src).unwrap();

        assert_ne!(src.encrypt_key, dst.encrypt_key);
        assert_eq!(dst.file_key(&m).unwrap(), file_key);
        assert!(dst.mac_verifies(&m));
    }

    #[test]
    fn test_everyone_grantee_matching() {
        let p = Permission::for_everyone_read();
        assert!(p.is_for("-Everyone"));
        assert!(p.is_for("everyone"));
        assert!(p.grants_anything());
        assert!(p.acm_share.is_null());
    }
}

//! Authorization service interface
//!
//! Clearance checks, ACM flattening, and snippet retrieval are delegated to
//! an external authorization service. The service is behavior-defined so the
//! daemon can be wired against the real client or the in-memory
//! [`FakeAccessControl`] used by tests and single-node deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::acm::AcmDocument;
use crate::models::{flatten, Resource};

/// Errors surfaced by the authorization service
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The caller's clearance does not dominate the ACM
    #[error("access denied: {0}")]
    Denied(String),
    /// The ACM itself failed validation
    #[error("acm rejected: {0}")]
    Invalid(String),
    /// Transport or service failure; never treated as a user denial
    #[error("authorization service failure: {0}")]
    Upstream(String),
}

/// One snippet field summarizing part of what the caller may access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetField {
    pub field_name: String,
    /// "allowed" or "disallowed"
    pub treatment: String,
    pub values: Vec<String>,
}

/// Structured authorization data summarizing a caller's accessible
/// dissemination markings; used to scope listings and derive groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snippets {
    pub fields: Vec<SnippetField>,
}

impl Snippets {
    pub fn field(&self, name: &str) -> Option<&SnippetField> {
        self.fields.iter().find(|f| f.field_name == name)
    }
}

/// Result of flattening an ACM, with any per-field validation messages
#[derive(Debug, Clone)]
pub struct FlattenResult {
    pub acm: AcmDocument,
    pub messages: Vec<String>,
}

/// The external authorization service
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Fails with [`AccessError::Denied`] when the caller's clearance does
    /// not dominate the ACM's classification, [`AccessError::Upstream`] on
    /// transport errors.
    async fn check_access(&self, dn: &str, acm: &AcmDocument) -> Result<(), AccessError>;

    /// Canonicalize an ACM, expanding short-form fields into their flattened
    /// companions (`share` gains a flattened `f_share`).
    async fn flatten_acm(&self, acm: &AcmDocument) -> Result<FlattenResult, AccessError>;

    async fn get_snippets(&self, dn: &str) -> Result<Snippets, AccessError>;
}

/// Derive the caller's flattened groups from snippets. The caller's own
/// flattened DN is always a member.
pub fn groups_from_snippets(dn: &str, snippets: &Snippets) -> Vec<String> {
    let mut groups = vec![flatten(dn)];
    if let Some(field) = snippets.field("f_share") {
        for value in &field.values {
            let value = flatten(value);
            if !groups.contains(&value) {
                groups.push(value);
            }
        }
    }
    groups
}

/// True iff the owner resource is `user/<dn>` or a group among the caller's
/// flattened groups.
pub fn is_user_owner(dn: &str, groups: &[String], owner: &str) -> bool {
    match Resource::parse(owner) {
        Ok(Resource::User { dn: owner_dn }) => flatten(&owner_dn) == flatten(dn),
        Ok(resource @ Resource::Group { .. }) => {
            let grantee = resource.grantee();
            groups.iter().any(|g| flatten(g) == grantee)
        }
        Err(_) => false,
    }
}

fn clearance_rank(classif: &str) -> Option<u8> {
    match classif.to_ascii_uppercase().as_str() {
        "U" => Some(0),
        "C" => Some(1),
        "S" => Some(2),
        "TS" => Some(3),
        _ => None,
    }
}

fn banner_for(classif: &str) -> String {
    match classif.to_ascii_uppercase().as_str() {
        "U" => "UNCLASSIFIED".to_string(),
        "C" => "CONFIDENTIAL".to_string(),
        "S" => "SECRET".to_string(),
        "TS" => "TOP SECRET".to_string(),
        other => other.to_string(),
    }
}

/// In-memory authorization service
///
/// Clearance is a per-user maximum classification rank (default
/// unclassified). Snippets are a per-user table; absent entries yield the
/// caller's own flattened DN as the only group.
#[derive(Debug, Default)]
pub struct FakeAccessControl {
    clearances: RwLock<HashMap<String, u8>>,
    snippets: RwLock<HashMap<String, Snippets>>,
}

impl FakeAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_clearance(&self, dn: &str, classif: &str) {
        if let Some(rank) = clearance_rank(classif) {
            self.clearances.write().unwrap().insert(flatten(dn), rank);
        }
    }

    pub fn set_snippets(&self, dn: &str, snippets: Snippets) {
        self.snippets.write().unwrap().insert(flatten(dn), snippets);
    }

    /// Add the caller to a flattened group, surfaced through the f_share
    /// snippet field.
    pub fn add_group(&self, dn: &str, group: &str) {
        let mut table = self.snippets.write().unwrap();
        let entry = table.entry(flatten(dn)).or_default();
        match entry.fields.iter_mut().find(|f| f.field_name == "f_share") {
            Some(field) => field.values.push(group.to_string()),
            None => entry.fields.push(SnippetField {
                field_name: "f_share".to_string(),
                treatment: "allowed".to_string(),
                values: vec![group.to_string()],
            }),
        }
    }

    fn classif_of(acm: &AcmDocument) -> Result<String, AccessError> {
        acm.part("classif")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AccessError::Invalid("acm has no classif".to_string()))
    }
}

#[async_trait]
impl AccessControl for FakeAccessControl {
    async fn check_access(&self, dn: &str, acm: &AcmDocument) -> Result<(), AccessError> {
        let classif = Self::classif_of(acm)?;
        let required = clearance_rank(&classif)
            .ok_or_else(|| AccessError::Invalid(format!("unknown classif {}", classif)))?;
        let held = self
            .clearances
            .read()
            .unwrap()
            .get(&flatten(dn))
            .copied()
            .unwrap_or(0);
        if held < required {
            return Err(AccessError::Denied(format!(
                "clearance does not dominate {}",
                classif
            )));
        }
        Ok(())
    }

    async fn flatten_acm(&self, acm: &AcmDocument) -> Result<FlattenResult, AccessError> {
        let classif = Self::classif_of(acm)?;
        if clearance_rank(&classif).is_none() {
            return Err(AccessError::Invalid(format!("unknown classif {}", classif)));
        }
        let mut flattened = acm.clone();
        let grantees: Vec<String> = flattened
            .share_resources()
            .iter()
            .map(Resource::grantee)
            .collect();
        flattened.set_f_share(grantees);
        if flattened.banner().is_none() {
            flattened.set_part("banner", serde_json::Value::String(banner_for(&classif)));
        }
        Ok(FlattenResult {
            acm: flattened,
            messages: Vec::new(),
        })
    }

    async fn get_snippets(&self, dn: &str) -> Result<Snippets, AccessError> {
        Ok(self
            .snippets
            .read()
            .unwrap()
            .get(&flatten(dn))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn acm(raw: &str) -> AcmDocument {
        AcmDocument::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_clearance_dominance() {
        let access = FakeAccessControl::new();
        access.grant_clearance("cn=cleared", "S");

        let secret = acm(r#"{"classif":"S"}"#);
        assert!(access.check_access("cn=cleared", &secret).await.is_ok());
        assert!(matches!(
            access.check_access("cn=uncleared", &secret).await,
            Err(AccessError::Denied(_))
        ));
        // Everyone dominates unclassified
        let unclass = acm(r#"{"classif":"U"}"#);
        assert!(access.check_access("cn=uncleared", &unclass).await.is_ok());
    }

    #[tokio::test]
    async fn test_flatten_populates_f_share_and_banner() {
        let access = FakeAccessControl::new();
        let doc = acm(
            r#"{"classif":"U","share":{"users":["cn=alpha"],"projects":{"p":{"groups":["g"]}}}}"#,
        );
        let flattened = access.flatten_acm(&doc).await.unwrap().acm;
        let f_share = flattened.f_share();
        assert!(f_share.contains(&Resource::user("cn=alpha").grantee()));
        assert!(f_share.contains(&"p_g".to_string()));
        assert_eq!(flattened.banner().unwrap(), "UNCLASSIFIED");
    }

    #[tokio::test]
    async fn test_flatten_rejects_missing_classif() {
        let access = FakeAccessControl::new();
        assert!(matches!(
            access.flatten_acm(&acm(r#"{"share":{}}"#)).await,
            Err(AccessError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_groups_from_snippets_includes_self() {
        let access = FakeAccessControl::new();
        access.add_group("cn=worker", "dctc_watchers");
        let snippets = access.get_snippets("cn=worker").await.unwrap();
        let groups = groups_from_snippets("cn=worker", &snippets);
        assert!(groups.contains(&flatten("cn=worker")));
        assert!(groups.contains(&"dctcwatchers".to_string()));
    }

    #[test]
    fn test_is_user_owner() {
        assert!(is_user_owner("cn=me", &[], "user/CN=Me"));
        assert!(!is_user_owner("cn=me", &[], "user/cn=you"));
        let groups = vec!["dctc_watchers".to_string()];
        assert!(is_user_owner("cn=me", &groups, "group/dctc/watchers"));
        assert!(!is_user_owner("cn=me", &[], "group/dctc/watchers"));
        assert!(!is_user_owner("cn=me", &[], "not a resource"));
    }
}

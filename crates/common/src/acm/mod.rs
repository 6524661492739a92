//! Access Control Markings
//!
//! An ACM is a JSON document describing classification, compartments, and
//! dissemination markings. The `share` field enumerates read grantees in
//! structured form; `f_share` is its flattened companion. An empty or absent
//! share means "everyone".

mod merge;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{flatten, Resource};

pub use merge::combine;

/// Errors that can occur handling ACM documents
#[derive(Debug, thiserror::Error)]
pub enum AcmError {
    #[error("missing ACM")]
    Missing,
    #[error("ACM unparseable: {0}")]
    Unparseable(#[from] serde_json::Error),
    #[error("ACM is not a JSON object")]
    NotAnObject,
}

/// A parsed ACM document. Keys are kept sorted so serialization is a
/// normalized form suitable for equality comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AcmDocument(Map<String, Value>);

impl AcmDocument {
    pub fn parse(raw: &str) -> Result<Self, AcmError> {
        if raw.trim().is_empty() {
            return Err(AcmError::Missing);
        }
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, AcmError> {
        match value {
            Value::Object(map) => Ok(AcmDocument(map)),
            _ => Err(AcmError::NotAnObject),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Normalized string form: object keys serialize in sorted order
    pub fn to_raw(&self) -> String {
        serde_json::to_string(&self.0).expect("acm serializes")
    }

    pub fn part(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set_part(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove_part(&mut self, key: &str) {
        self.0.remove(key);
    }

    /// The classification banner, if present
    pub fn banner(&self) -> Option<String> {
        self.part("banner")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn share(&self) -> Option<&Value> {
        self.part("share")
    }

    /// An empty share means every authenticated user can read
    pub fn share_is_everyone(&self) -> bool {
        match self.share() {
            None | Some(Value::Null) => true,
            Some(Value::Object(m)) => {
                let users_empty = m
                    .get("users")
                    .map(|u| u.as_array().map(Vec::is_empty).unwrap_or(true))
                    .unwrap_or(true);
                let projects_empty = m
                    .get("projects")
                    .map(|p| p.as_object().map(Map::is_empty).unwrap_or(true))
                    .unwrap_or(true);
                users_empty && projects_empty
            }
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(_) => false,
        }
    }

    /// The flattened share grantees from `f_share`
    pub fn f_share(&self) -> Vec<String> {
        match self.part("f_share") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_f_share(&mut self, grantees: Vec<String>) {
        self.set_part(
            "f_share",
            Value::Array(grantees.into_iter().map(Value::String).collect()),
        );
    }

    /// Add a flattened grantee to `f_share` if not already present
    pub fn add_f_share(&mut self, grantee: &str) {
        let mut current = self.f_share();
        if !current.iter().any(|g| flatten(g) == flatten(grantee)) {
            current.push(grantee.to_string());
            self.set_f_share(current);
        }
    }

    /// Merge a share fragment into the `share` field
    pub fn add_share_fragment(&mut self, fragment: &Value) {
        let combined = match self.share() {
            Some(existing) => combine(existing, fragment),
            None => fragment.clone(),
        };
        self.set_part("share", combined);
    }

    pub fn clear_share(&mut self) {
        self.remove_part("share");
        self.remove_part("f_share");
    }

    /// The principals the structured share names
    pub fn share_resources(&self) -> Vec<Resource> {
        let mut resources = Vec::new();
        let Some(Value::Object(share)) = self.share() else {
            return resources;
        };
        if let Some(Value::Array(users)) = share.get("users") {
            for dn in users.iter().filter_map(Value::as_str) {
                resources.push(Resource::user(dn));
            }
        }
        if let Some(Value::Object(projects)) = share.get("projects") {
            for (project, body) in projects {
                let display = body
                    .get("disp_nm")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(Value::Array(groups)) = body.get("groups") {
                    for group in groups.iter().filter_map(Value::as_str) {
                        resources.push(Resource::Group {
                            project: Some(project.clone()),
                            group: group.to_string(),
                            display: display.clone(),
                        });
                    }
                }
            }
        }
        resources
    }

    /// Whether the `share` part differs from another ACM's, compared on
    /// normalized serializations.
    pub fn share_differs(&self, other: &AcmDocument) -> bool {
        let a = self.share().cloned().unwrap_or(Value::Null);
        let b = other.share().cloned().unwrap_or(Value::Null);
        serde_json::to_string(&a).ok() != serde_json::to_string(&b).ok()
    }
}

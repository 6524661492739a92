use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved group name meaning "every authenticated user".
pub const EVERYONE_GROUP: &str = "-Everyone";

/// Errors that can occur while parsing resource strings
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid resource string: {0}")]
    Invalid(String),
}

/// A principal named by a resource string
///
/// Two forms exist: `user/<dn>` for individual users and
/// `group/<project>/<group>[/<display>]` for project groups. The reserved
/// group `group/-Everyone` names all authenticated users and carries no
/// project component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    User {
        dn: String,
    },
    Group {
        project: Option<String>,
        group: String,
        display: Option<String>,
    },
}

impl Resource {
    pub fn user(dn: impl Into<String>) -> Self {
        Resource::User { dn: dn.into() }
    }

    pub fn group(project: impl Into<String>, group: impl Into<String>) -> Self {
        Resource::Group {
            project: Some(project.into()),
            group: group.into(),
            display: None,
        }
    }

    pub fn everyone() -> Self {
        Resource::Group {
            project: None,
            group: EVERYONE_GROUP.to_string(),
            display: None,
        }
    }

    /// Parse a resource string of the form `user/<dn>` or
    /// `group/<project>/<group>[/<display>]`.
    pub fn parse(s: &str) -> Result<Self, ResourceError> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("user/") {
            if rest.is_empty() {
                return Err(ResourceError::Invalid(s.to_string()));
            }
            return Ok(Resource::User {
                dn: rest.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("group/") {
            if rest.is_empty() {
                return Err(ResourceError::Invalid(s.to_string()));
            }
            let parts: Vec<&str> = rest.splitn(3, '/').collect();
            return Ok(match parts.as_slice() {
                [group] => Resource::Group {
                    project: None,
                    group: group.to_string(),
                    display: None,
                },
                [project, group] => Resource::Group {
                    project: Some(project.to_string()),
                    group: group.to_string(),
                    display: None,
                },
                [project, group, display] => Resource::Group {
                    project: Some(project.to_string()),
                    group: group.to_string(),
                    display: Some(display.to_string()),
                },
                _ => return Err(ResourceError::Invalid(s.to_string())),
            });
        }
        Err(ResourceError::Invalid(s.to_string()))
    }

    /// The flattened grantee form used for comparisons and as the permission
    /// grantee key.
    pub fn grantee(&self) -> String {
        match self {
            Resource::User { dn } => flatten(dn),
            Resource::Group { project, group, .. } => match project {
                Some(p) => format!("{}_{}", flatten(p), flatten(group)),
                None => flatten(group),
            },
        }
    }

    pub fn is_everyone(&self) -> bool {
        matches!(self, Resource::Group { group, .. } if flatten(group) == flatten(EVERYONE_GROUP))
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Resource::User { .. })
    }

    /// The ACM `share` fragment that grants read to this principal.
    ///
    /// Users land under `users`, groups under
    /// `projects.<project>.groups`. The everyone group has no fragment; an
    /// empty share already means everyone.
    pub fn acm_share_fragment(&self) -> Option<serde_json::Value> {
        if self.is_everyone() {
            return None;
        }
        match self {
            Resource::User { dn } => Some(serde_json::json!({ "users": [dn] })),
            Resource::Group {
                project,
                group,
                display,
            } => {
                let project = project.as_deref().unwrap_or(group);
                let disp = display.as_deref().unwrap_or(project);
                Some(serde_json::json!({
                    "projects": {
                        project: {
                            "disp_nm": disp,
                            "groups": [group],
                        }
                    }
                }))
            }
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::User { dn } => write!(f, "user/{}", dn),
            Resource::Group {
                project,
                group,
                display,
            } => {
                write!(f, "group")?;
                if let Some(p) = project {
                    write!(f, "/{}", p)?;
                }
                write!(f, "/{}", group)?;
                if let Some(d) = display {
                    write!(f, "/{}", d)?;
                }
                Ok(())
            }
        }
    }
}

/// Flatten a grantee or distinguished name for comparison: lowercase with
/// every non-alphanumeric character removed. Both sides of any grantee
/// comparison must be flattened.
pub fn flatten(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_user_resource() {
        let r = Resource::parse("user/cn=test tester10,ou=people,o=u.s. project,c=us").unwrap();
        assert_eq!(
            r,
            Resource::User {
                dn: "cn=test tester10,ou=people,o=u.s. project,c=us".to_string()
            }
        );
        assert_eq!(
            r.to_string(),
            "user/cn=test tester10,ou=people,o=u.s. project,c=us"
        );
    }

    #[test]
    fn test_parse_group_resource() {
        let r = Resource::parse("group/dctc/watchers/Watchers Display").unwrap();
        assert_eq!(
            r,
            Resource::Group {
                project: Some("dctc".to_string()),
                group: "watchers".to_string(),
                display: Some("Watchers Display".to_string()),
            }
        );
        assert_eq!(r.grantee(), "dctc_watchers");
    }

    #[test]
    fn test_everyone_resource() {
        let r = Resource::parse("group/-Everyone").unwrap();
        assert!(r.is_everyone());
        assert_eq!(r.to_string(), "group/-Everyone");
        assert!(r.acm_share_fragment().is_none());
    }

    #[test]
    fn test_flatten_strips_punctuation() {
        assert_eq!(
            flatten("CN=test tester10,OU=People,O=U.S. Project,C=US"),
            "cntesttester10oupeopleousprojectcus"
        );
        assert_eq!(flatten("-Everyone"), "everyone");
    }

    #[test]
    fn test_invalid_resource_strings() {
        assert!(Resource::parse("").is_err());
        assert!(Resource::parse("user/").is_err());
        assert!(Resource::parse("share/xyz").is_err());
    }
}

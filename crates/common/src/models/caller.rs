use serde::{Deserialize, Serialize};

/// How the caller identity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Direct TLS client, identified by the peer certificate DN only
    Normal,
    /// A whitelisted front-end asserting a user identity via headers
    Impersonation,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum CallerError {
    #[error("unauthorized: missing the user_dn")]
    MissingUserDn,
    #[error("unauthorized: {0} is not authorized to impersonate")]
    NotWhitelisted(String),
    #[error("unauthorized: invalid connection, required identity headers are missing")]
    MissingHeaders,
}

/// The derived identity for one request, built from the identity headers and
/// validated against the impersonation whitelist before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    /// The unique, normalized identity of the acting user
    pub distinguished_name: String,
    pub common_name: String,
    /// Value of the USER_DN header
    pub user_distinguished_name: String,
    /// Value of the SSL_CLIENT_S_DN header (peer certificate DN)
    pub ssl_client_s_distinguished_name: String,
    /// Value of the EXTERNAL_SYS_DN header
    pub external_system_distinguished_name: String,
    pub transaction_type: TransactionType,
    /// Flattened groups resolved from the caller's snippets
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Caller {
    /// Build a caller from the raw identity header values. The effective
    /// identity prefers USER_DN (impersonation) over the certificate DN.
    pub fn from_headers(user_dn: &str, ssl_client_s_dn: &str, external_sys_dn: &str) -> Self {
        let user_dn = normalize_distinguished_name(user_dn);
        let effective = if user_dn.is_empty() {
            normalize_distinguished_name(ssl_client_s_dn)
        } else {
            user_dn.clone()
        };
        Caller {
            common_name: common_name(&effective),
            distinguished_name: effective,
            user_distinguished_name: user_dn,
            ssl_client_s_distinguished_name: ssl_client_s_dn.trim().to_string(),
            external_system_distinguished_name: external_sys_dn.trim().to_string(),
            transaction_type: TransactionType::Unknown,
            groups: Vec::new(),
        }
    }

    /// Validate the header combination and set the transaction type.
    ///
    /// Normal: only the certificate DN present. Impersonation: USER_DN plus
    /// the certificate DN (and optionally EXTERNAL_SYS_DN), where every
    /// non-user DN must appear in the whitelist. A certificate plus system DN
    /// without USER_DN is rejected.
    pub fn validate_headers(&mut self, whitelist: &[String]) -> Result<(), CallerError> {
        let user = !self.user_distinguished_name.is_empty();
        let ssl = !self.ssl_client_s_distinguished_name.is_empty();
        let external = !self.external_system_distinguished_name.is_empty();

        match (user, ssl, external) {
            (false, true, false) => {
                self.transaction_type = TransactionType::Normal;
                Ok(())
            }
            (true, true, true) => {
                self.transaction_type = TransactionType::Impersonation;
                self.require_whitelisted(whitelist, &self.ssl_client_s_distinguished_name)?;
                self.require_whitelisted(whitelist, &self.external_system_distinguished_name)?;
                Ok(())
            }
            (true, true, false) => {
                self.transaction_type = TransactionType::Impersonation;
                self.require_whitelisted(whitelist, &self.ssl_client_s_distinguished_name)?;
                Ok(())
            }
            (false, true, true) => {
                self.transaction_type = TransactionType::Impersonation;
                Err(CallerError::MissingUserDn)
            }
            _ => {
                self.transaction_type = TransactionType::Unknown;
                Err(CallerError::MissingHeaders)
            }
        }
    }

    fn require_whitelisted(&self, whitelist: &[String], dn: &str) -> Result<(), CallerError> {
        let normalized = normalize_distinguished_name(dn);
        let listed = whitelist
            .iter()
            .any(|w| normalize_distinguished_name(w).eq_ignore_ascii_case(&normalized));
        if listed {
            Ok(())
        } else {
            Err(CallerError::NotWhitelisted(normalized))
        }
    }
}

/// Canonicalize a distinguished name: trim the whole string and the segment
/// around each comma separator.
pub fn normalize_distinguished_name(dn: &str) -> String {
    dn.trim()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Extract the CN component from a distinguished name
pub fn common_name(dn: &str) -> String {
    dn.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.len() >= 3 && part[..3].eq_ignore_ascii_case("cn=") {
                Some(part[3..].to_string())
            } else {
                None
            }
        })
        .next()
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normal_transaction() {
        let mut c = Caller::from_headers("", "cn=test tester10,o=org", "");
        c.validate_headers(&[]).unwrap();
        assert_eq!(c.transaction_type, TransactionType::Normal);
        assert_eq!(c.distinguished_name, "cn=test tester10,o=org");
        assert_eq!(c.common_name, "test tester10");
    }

    #[test]
    fn test_impersonation_requires_whitelist() {
        let mut c = Caller::from_headers("cn=real user,o=org", "cn=proxy,o=org", "");
        assert!(c.validate_headers(&[]).is_err());
        c.validate_headers(&["CN=Proxy, O=Org".to_string()]).unwrap();
        assert_eq!(c.transaction_type, TransactionType::Impersonation);
        assert_eq!(c.distinguished_name, "cn=real user,o=org");
    }

    #[test]
    fn test_missing_user_dn_in_impersonation_triple() {
        let mut c = Caller::from_headers("", "cn=proxy,o=org", "cn=sys,o=org");
        let err = c.validate_headers(&["cn=proxy,o=org".into(), "cn=sys,o=org".into()]);
        assert!(matches!(err, Err(CallerError::MissingUserDn)));
    }

    #[test]
    fn test_no_headers_is_unauthorized() {
        let mut c = Caller::from_headers("", "", "");
        assert!(matches!(
            c.validate_headers(&[]),
            Err(CallerError::MissingHeaders)
        ));
        assert_eq!(c.transaction_type, TransactionType::Unknown);
    }

    #[test]
    fn test_normalization_trims_segments() {
        assert_eq!(
            normalize_distinguished_name(" cn=a b , ou=c,  o=d "),
            "cn=a b,ou=c,o=d"
        );
    }
}

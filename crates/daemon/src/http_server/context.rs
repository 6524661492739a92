use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;

use common::auth::groups_from_snippets;
use common::auth::Snippets;
use common::models::{flatten, Caller};

use crate::events::{ActionResult, EventTemplate};
use crate::state::ServiceState;

use super::error::AppError;
use super::SessionId;

/// Immutable per-request bundle built in the router prelude. Handlers read
/// exclusively from this; nothing mutates it after dispatch.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub caller: Caller,
    pub groups: Vec<String>,
    pub snippets: Snippets,
    pub event: EventTemplate,
    /// The caller is a peer replica fetching ciphertext; user lookup and
    /// group resolution are skipped.
    pub is_peer: bool,
}

impl RequestContext {
    pub fn dn(&self) -> &str {
        &self.caller.distinguished_name
    }
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Derive the caller identity from the request headers
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    Caller::from_headers(
        header(headers, "USER_DN"),
        header(headers, "SSL_CLIENT_S_DN"),
        header(headers, "EXTERNAL_SYS_DN"),
    )
}

/// Router prelude: validate identity headers, resolve the user record and
/// authorization data, and stash the context for the handler.
///
/// Emits an `authenticate` event reflecting the header-validation outcome.
/// The peer signifier bypasses user lookup entirely and reaches only the
/// ciphertext routes.
pub async fn require_context(
    State(state): State<ServiceState>,
    mut request: Request,
    next: Next,
) -> Response {
    let session_id = request
        .extensions()
        .get::<SessionId>()
        .map(|s| s.0.clone())
        .unwrap_or_default();

    let headers = request.headers().clone();
    let mut caller = caller_from_headers(&headers);

    let event = EventTemplate {
        session_id: session_id.clone(),
        user_dn: caller.distinguished_name.clone(),
        system_ip: header(&headers, "X-Real-IP").to_string(),
        x_forwarded_for: header(&headers, "X-Forwarded-For").to_string(),
    };

    let is_peer = !caller.distinguished_name.is_empty()
        && flatten(&caller.distinguished_name) == flatten(state.peer_signifier());

    if !is_peer {
        if let Err(e) = caller.validate_headers(&state.config().impersonation_whitelist) {
            state.audit(
                &event,
                "authenticate",
                ActionResult::Failure,
                None,
                vec![e.to_string()],
            );
            return AppError::unauthorized(e.to_string()).into_response();
        }
    }
    state.audit(&event, "authenticate", ActionResult::Success, None, vec![]);

    let (groups, snippets) = if is_peer {
        (Vec::new(), Snippets::default())
    } else {
        // Load or create the user record, through the bounded cache
        let dn = caller.distinguished_name.clone();
        if state.users().get(&flatten(&dn)).is_none() {
            match state.store().get_or_create_user(&dn).await {
                Ok(record) => state.users().insert(flatten(&dn), record),
                Err(e) => {
                    return AppError::from_store(e, "unable to load user record")
                        .into_response()
                }
            }
        }
        let snippets = match state.access().get_snippets(&dn).await {
            Ok(snippets) => snippets,
            Err(e) => return AppError::from_access(e).into_response(),
        };
        (groups_from_snippets(&dn, &snippets), snippets)
    };
    caller.groups = groups.clone();

    let context = RequestContext {
        session_id,
        caller,
        groups,
        snippets,
        event,
        is_peer,
    };
    request.extensions_mut().insert(context);
    next.run(request).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_caller_from_headers_prefers_user_dn() {
        let mut headers = HeaderMap::new();
        headers.insert("USER_DN", "cn=real user,o=org".parse().unwrap());
        headers.insert("SSL_CLIENT_S_DN", "cn=proxy,o=org".parse().unwrap());
        let caller = caller_from_headers(&headers);
        assert_eq!(caller.distinguished_name, "cn=real user,o=org");
    }

    #[test]
    fn test_caller_from_headers_falls_back_to_certificate() {
        let mut headers = HeaderMap::new();
        headers.insert("SSL_CLIENT_S_DN", "cn=direct,o=org".parse().unwrap());
        let caller = caller_from_headers(&headers);
        assert_eq!(caller.distinguished_name, "cn=direct,o=org");
    }
}

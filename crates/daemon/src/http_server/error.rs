use axum::response::{IntoResponse, Response};
use http::StatusCode;

use common::auth::AccessError;
use common::models::ObjectIdError;

use crate::ciphertext::CacheError;
use crate::database::StoreError;

/// Structured error carried from deep helpers to the HTTP boundary.
///
/// Records the first raise site; the dispatcher renders the code and message
/// as the response and logs at a level chosen by the code.
#[derive(Debug)]
pub struct AppError {
    pub code: StatusCode,
    pub msg: String,
    pub cause: Option<String>,
    pub file: &'static str,
    pub line: u32,
}

impl AppError {
    #[track_caller]
    pub fn new(code: StatusCode, msg: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        AppError {
            code,
            msg: msg.into(),
            cause: None,
            file: location.file(),
            line: location.line(),
        }
    }

    #[track_caller]
    pub fn with_cause(
        code: StatusCode,
        msg: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        let location = std::panic::Location::caller();
        AppError {
            code,
            msg: msg.into(),
            cause: Some(cause.to_string()),
            file: location.file(),
            line: location.line(),
        }
    }

    #[track_caller]
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    #[track_caller]
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    #[track_caller]
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    #[track_caller]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    #[track_caller]
    pub fn method_not_allowed(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, msg)
    }

    #[track_caller]
    pub fn gone(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, msg)
    }

    #[track_caller]
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_REQUIRED, msg)
    }

    #[track_caller]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    #[track_caller]
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, msg)
    }

    /// Map store failures: stale tokens surface the precondition code
    #[track_caller]
    pub fn from_store(err: StoreError, context: &str) -> Self {
        match err {
            StoreError::NotFound => Self::new(StatusCode::NOT_FOUND, "Not found"),
            StoreError::Precondition(msg) => Self::new(StatusCode::PRECONDITION_REQUIRED, msg),
            StoreError::Internal(e) => {
                Self::with_cause(StatusCode::INTERNAL_SERVER_ERROR, context.to_string(), e)
            }
        }
    }

    /// Map authorization-service failures: denial is the caller's problem,
    /// transport failures are upstream.
    #[track_caller]
    pub fn from_access(err: AccessError) -> Self {
        match err {
            AccessError::Denied(msg) => Self::with_cause(
                StatusCode::FORBIDDEN,
                "Forbidden - caller is not cleared for this object",
                msg,
            ),
            AccessError::Invalid(msg) => {
                Self::with_cause(StatusCode::BAD_REQUEST, "ACM rejected", msg)
            }
            AccessError::Upstream(msg) => Self::with_cause(
                StatusCode::BAD_GATEWAY,
                "Authorization service unavailable",
                msg,
            ),
        }
    }

    #[track_caller]
    pub fn from_cache(err: CacheError, context: &str) -> Self {
        match err {
            CacheError::NotFound => Self::new(StatusCode::NOT_FOUND, "Ciphertext not found"),
            other => Self::with_cause(StatusCode::INTERNAL_SERVER_ERROR, context.to_string(), other),
        }
    }
}

impl From<ObjectIdError> for AppError {
    #[track_caller]
    fn from(err: ObjectIdError) -> Self {
        AppError::with_cause(StatusCode::BAD_REQUEST, "Invalid object id", err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code.as_u16();
        if code >= 500 {
            tracing::error!(
                code,
                msg = %self.msg,
                cause = self.cause.as_deref().unwrap_or(""),
                raised_at = format!("{}:{}", self.file, self.line),
                "request failed"
            );
        } else if code >= 400 {
            tracing::warn!(
                code,
                msg = %self.msg,
                cause = self.cause.as_deref().unwrap_or(""),
                raised_at = format!("{}:{}", self.file, self.line),
                "request rejected"
            );
        } else {
            tracing::info!(code, msg = %self.msg, "request finished");
        }
        (self.code, self.msg).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_raise_site_is_recorded() {
        let err = AppError::bad_request("nope");
        assert!(err.file.ends_with("error.rs"));
        assert!(err.line > 0);
    }

    #[test]
    fn test_store_error_mapping() {
        let err = AppError::from_store(StoreError::Precondition("stale".into()), "ctx");
        assert_eq!(err.code, StatusCode::PRECONDITION_REQUIRED);
        let err = AppError::from_store(StoreError::NotFound, "ctx");
        assert_eq!(err.code, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_access_error_mapping() {
        assert_eq!(
            AppError::from_access(AccessError::Denied("d".into())).code,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from_access(AccessError::Upstream("u".into())).code,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from_access(AccessError::Invalid("i".into())).code,
            StatusCode::BAD_REQUEST
        );
    }
}

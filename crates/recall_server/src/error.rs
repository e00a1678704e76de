//! Error taxonomy for the HTTP surface.
//!
//! Engines return [`ServerError`] values; this module is the single place
//! where error kinds become HTTP statuses and bodies. Inside a sync
//! transaction every error is recovered locally — the context is
//! discarded, the per-user lock released — before the error surfaces here
//! as the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use recall_core::CoreError;
use serde_json::json;
use thiserror::Error;

/// Result type for request handling.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced to clients.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A discovery probe: the client has no credentials yet and expects a
    /// 400 with the canonical body so it can show its login dialog.
    #[error("expected auth")]
    AuthExpected,

    /// Missing, unknown or malformed session key; bad credentials.
    #[error("not authorized")]
    Unauthorized,

    /// Another sync is in progress for this user.
    #[error("a sync is already in progress for this user")]
    Busy,

    /// Malformed body, wrong compression, or an operation that does not
    /// fit the current sync state.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Incremental sync is impossible; the client must full-sync.
    #[error("schema lock: {0}")]
    SchemaLock(String),

    /// The identity gateway (or similar dependency) is unavailable.
    #[error("temporarily unavailable: {0}")]
    Temporary(String),

    /// Anything else; details stay in the log.
    #[error("internal error")]
    Internal,
}

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SchemaLock(msg) => ServerError::SchemaLock(msg),
            CoreError::GatewayUnavailable(msg) => ServerError::Temporary(msg),
            CoreError::Corrupt(msg) => ServerError::BadRequest(msg),
            CoreError::InvalidData(msg)
            | CoreError::InvalidArchive(msg)
            | CoreError::InvalidFilename(msg) => ServerError::BadRequest(msg),
            other => {
                tracing::error!("internal error: {other}");
                ServerError::Internal
            }
        }
    }
}

impl ServerError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::AuthExpected => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized => StatusCode::FORBIDDEN,
            ServerError::Busy => StatusCode::CONFLICT,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::SchemaLock(_) => StatusCode::BAD_REQUEST,
            ServerError::Temporary(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // The canonical discovery answer is a bare string body.
            ServerError::AuthExpected => (status, "expected auth").into_response(),
            ServerError::Busy => (
                status,
                Json(json!({"err": self.to_string(), "retry": true})),
            )
                .into_response(),
            other => (status, Json(json!({"err": other.to_string()}))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServerError::AuthExpected.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::Unauthorized.status(), StatusCode::FORBIDDEN);
        assert_eq!(ServerError::Busy.status(), StatusCode::CONFLICT);
        assert_eq!(
            ServerError::Temporary("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn core_errors_classified() {
        let err: ServerError = CoreError::SchemaLock("drift".into()).into();
        assert!(matches!(err, ServerError::SchemaLock(_)));

        let err: ServerError = CoreError::GatewayUnavailable("down".into()).into();
        assert!(matches!(err, ServerError::Temporary(_)));

        let err: ServerError = CoreError::InvalidArchive("junk".into()).into();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let err: ServerError = CoreError::RootLocked.into();
        assert!(matches!(err, ServerError::Internal));
    }
}

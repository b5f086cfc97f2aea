//! HTTP-facing error model.
//! Handlers return `AppResult`; internal detail is logged where the error is produced and only
//! the generic message below reaches the client.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::identity::AuthError;

pub const UNAUTHORIZED_DETAIL: &str = "Could not validate credentials";
pub const BAD_LOGIN_DETAIL: &str = "Incorrect email or password";
pub const DUPLICATE_DETAIL: &str = "Email already registered";
pub const INTERNAL_DETAIL: &str = "Internal server error";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Auth { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Auth { .. } => 401,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential => AppError::auth("unauthorized", BAD_LOGIN_DETAIL),
            AuthError::DuplicateIdentity => AppError::user("email_registered", DUPLICATE_DETAIL),
            AuthError::TokenInvalid
            | AuthError::TokenExpired
            | AuthError::MissingCredential
            | AuthError::UnknownPrincipal
            | AuthError::InactivePrincipal => AppError::auth("unauthorized", UNAUTHORIZED_DETAIL),
            AuthError::Storage(_) | AuthError::Internal(_) => AppError::internal("internal", INTERNAL_DETAIL),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {err:#}");
        AppError::internal("internal", INTERNAL_DETAIL)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut resp = (status, Json(serde_json::json!({ "detail": self.message() }))).into_response();
        if let AppError::Auth { .. } = self {
            resp.headers_mut().insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::auth("auth", "no").http_status(), 401);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn token_and_principal_failures_collapse() {
        let kinds = [
            AuthError::TokenInvalid,
            AuthError::TokenExpired,
            AuthError::MissingCredential,
            AuthError::UnknownPrincipal,
            AuthError::InactivePrincipal,
        ];
        let mapped: Vec<AppError> = kinds.into_iter().map(AppError::from).collect();
        assert!(mapped.iter().all(|e| *e == mapped[0]));
        assert_eq!(mapped[0].message(), UNAUTHORIZED_DETAIL);
        assert_eq!(mapped[0].http_status(), 401);
    }

    #[test]
    fn internal_detail_not_leaked() {
        let e = AppError::from(AuthError::Storage("disk on fire at /var/db".into()));
        assert_eq!(e.http_status(), 500);
        assert!(!e.message().contains("disk"));
        let e = AppError::from(AuthError::DuplicateIdentity);
        assert_eq!((e.http_status(), e.message()), (400, DUPLICATE_DETAIL));
    }

    #[test]
    fn auth_response_carries_challenge() {
        let resp = AppError::auth("unauthorized", UNAUTHORIZED_DETAIL).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
        let resp = AppError::user("email_registered", DUPLICATE_DETAIL).into_response();
        assert!(resp.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}

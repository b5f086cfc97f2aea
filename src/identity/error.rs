use thiserror::Error;

use crate::storage::StoreError;

/// Internal authentication failures. The variant is kept for logs and span attributes; the HTTP
/// boundary collapses them (see `AppError::from`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredential,
    #[error("identity already registered")]
    DuplicateIdentity,
    #[error("token signature or format invalid")]
    TokenInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("missing or malformed bearer credential")]
    MissingCredential,
    #[error("token subject no longer exists")]
    UnknownPrincipal,
    #[error("principal is inactive")]
    InactivePrincipal,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable label for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidCredential => "invalid_credential",
            AuthError::DuplicateIdentity => "duplicate_identity",
            AuthError::TokenInvalid => "token_invalid",
            AuthError::TokenExpired => "token_expired",
            AuthError::MissingCredential => "missing_credential",
            AuthError::UnknownPrincipal => "unknown_principal",
            AuthError::InactivePrincipal => "inactive_principal",
            AuthError::Storage(_) => "storage",
            AuthError::Internal(_) => "internal",
        }
    }

    /// True for the kinds that answer 401 at the boundary.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredential
                | AuthError::TokenInvalid
                | AuthError::TokenExpired
                | AuthError::MissingCredential
                | AuthError::UnknownPrincipal
                | AuthError::InactivePrincipal
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(_) => AuthError::DuplicateIdentity,
            StoreError::Backend(m) => AuthError::Storage(m),
        }
    }
}

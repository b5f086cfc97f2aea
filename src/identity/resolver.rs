//! Bearer header -> active principal.

use super::error::AuthError;
use super::principal::Principal;
use super::token::TokenService;
use crate::storage::PrincipalStore;

/// Extract the token from `Bearer <token>`. The scheme is case-insensitive (RFC 7235); exactly
/// one space separates it from a non-empty token that contains no whitespace.
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthError> {
    let value = authorization.ok_or(AuthError::MissingCredential)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingCredential)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(AuthError::MissingCredential);
    }
    Ok(token)
}

/// Resolve the caller from an `Authorization` header value.
pub fn resolve(tokens: &TokenService, store: &dyn PrincipalStore, authorization: Option<&str>) -> Result<Principal, AuthError> {
    let token = bearer_token(authorization)?;
    let subject = tokens.validate(token)?;
    let record = store.find_principal_by_identity(&subject)?.ok_or(AuthError::UnknownPrincipal)?;
    if !record.principal.is_active {
        return Err(AuthError::InactivePrincipal);
    }
    Ok(record.principal)
}

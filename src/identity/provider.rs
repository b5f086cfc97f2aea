use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::AuthError;
use super::principal::Principal;
use super::token::TokenService;
use crate::security::CredentialVerifier;
use crate::storage::PrincipalStore;

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
}

pub trait AuthProvider: Send + Sync {
    fn signup(&self, store: &dyn PrincipalStore, req: &SignupRequest) -> Result<Principal, AuthError>;
    fn login(&self, store: &dyn PrincipalStore, req: &LoginRequest) -> Result<LoginResponse, AuthError>;
}

/// Password login against the principal store, answering with a bearer token.
pub struct LocalAuthProvider {
    verifier: CredentialVerifier,
    tokens: Arc<TokenService>,
}

impl LocalAuthProvider {
    pub fn new(verifier: CredentialVerifier, tokens: Arc<TokenService>) -> Self { Self { verifier, tokens } }

    pub fn tokens(&self) -> &Arc<TokenService> { &self.tokens }
}

impl AuthProvider for LocalAuthProvider {
    fn signup(&self, store: &dyn PrincipalStore, req: &SignupRequest) -> Result<Principal, AuthError> {
        if store.find_principal_by_identity(&req.email)?.is_some() {
            warn!(target: "auth", email = %req.email, "signup attempt for existing email");
            return Err(AuthError::DuplicateIdentity);
        }
        let hash = self.verifier.hash_password(&req.password)
            .map_err(|e| AuthError::Internal(format!("hash: {e}")))?;
        // a concurrent signup can still win between the lookup and here; the store decides
        let principal = store.insert_principal(&req.email, hash).map_err(|e| {
            warn!(target: "auth", email = %req.email, "signup lost race for email: {e}");
            AuthError::from(e)
        })?;
        info!(target: "auth", email = %principal.identity, id = principal.id, "created new user");
        Ok(principal)
    }

    fn login(&self, store: &dyn PrincipalStore, req: &LoginRequest) -> Result<LoginResponse, AuthError> {
        let principal = self.verifier.authenticate(store, &req.email, &req.password).map_err(|e| {
            warn!(target: "auth", email = %req.email, reason = e.kind(), "failed login attempt");
            e
        })?;
        let token = self.tokens.issue(&principal.identity)?;
        info!(target: "auth", email = %principal.identity, "user logged in");
        Ok(LoginResponse { access_token: token.into_string(), token_type: "bearer".into() })
    }
}

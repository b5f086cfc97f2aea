//! Bearer token issue and validation (HS256 JWT).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::error::AuthError;

pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_secs: u64) -> Self { ManualClock(AtomicU64::new(start_secs)) }
    pub fn set(&self, secs: u64) { self.0.store(secs, Ordering::SeqCst); }
    pub fn advance(&self, by: Duration) { self.0.fetch_add(by.as_secs(), Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// A signed token. `Debug` does not print it.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_string(self) -> String { self.0 }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Token(<redacted>)") }
}

/// Issues and validates tokens with one process-wide secret, fixed at construction.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self::with_clock(secret, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &[u8], ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        // Signature and claim shape are checked by jsonwebtoken; expiry is checked here against
        // our clock with zero leeway.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
            clock,
        }
    }

    pub fn issue(&self, subject: &str) -> Result<Token, AuthError> {
        let now = self.clock.now_secs();
        let claims = Claims { sub: subject.to_string(), iat: now, exp: now.saturating_add(self.ttl.as_secs()) };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map(Token)
            .map_err(|e| AuthError::Internal(format!("token encode: {e}")))
    }

    /// Verify and return the claims. Signature first, then `exp > now`.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(target: "token", error = %e, "token rejected");
            AuthError::TokenInvalid
        })?;
        if data.claims.exp <= self.clock.now_secs() {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    /// Verify and return the subject identity.
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        self.decode(token).map(|c| c.sub)
    }
}

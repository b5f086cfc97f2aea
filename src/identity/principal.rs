use std::fmt;

use serde::{Deserialize, Serialize};

/// An authenticated identity as seen outside the credential boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: u64,
    #[serde(rename = "email")]
    pub identity: String,
    pub is_active: bool,
}

/// Argon2 PHC string for a principal's secret. Opaque outside the crate and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHash(String);

impl SecretHash {
    pub(crate) fn from_phc(phc: String) -> Self { SecretHash(phc) }
    pub(crate) fn as_phc(&self) -> &str { &self.0 }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("SecretHash(<redacted>)") }
}

/// What the storage collaborator keeps per identity.
#[derive(Debug, Clone)]
pub struct PrincipalRecord {
    pub principal: Principal,
    pub secret_hash: SecretHash,
}

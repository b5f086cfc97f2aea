//! Credential hashing and verification (Argon2id, PHC strings with per-record salt).

use anyhow::{anyhow, Result};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use password_hash::{PasswordHash, SaltString};

use crate::identity::{AuthError, Principal, SecretHash};
use crate::storage::PrincipalStore;

/// Checks candidate secrets against stored hashes.
///
/// Unknown identities are verified against a dummy hash made with the same parameters, so a
/// miss costs the same Argon2 work as a wrong password and returns the same error.
pub struct CredentialVerifier {
    argon2: Argon2<'static>,
    dummy: SecretHash,
}

impl CredentialVerifier {
    /// Argon2id with the crate's default cost parameters.
    pub fn new() -> Result<Self> {
        Self::with_params(Params::default())
    }

    pub fn with_params(params: Params) -> Result<Self> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut filler = [0u8; 32];
        getrandom::getrandom(&mut filler).map_err(|e| anyhow!(e.to_string()))?;
        let dummy = hash_with(&argon2, &String::from_utf8_lossy(&filler))?;
        Ok(Self { argon2, dummy })
    }

    /// Cheapest parameters Argon2 accepts. Only for tests and local tooling.
    pub fn insecure_fast() -> Result<Self> {
        let params = Params::new(Params::MIN_M_COST.max(8), 1, 1, None).map_err(|e| anyhow!(e.to_string()))?;
        Self::with_params(params)
    }

    pub fn hash_password(&self, password: &str) -> Result<SecretHash> {
        hash_with(&self.argon2, password)
    }

    /// Compare a candidate against a stored hash. Unparseable hashes never match.
    pub fn verify_password(&self, hash: &SecretHash, password: &str) -> bool {
        match PasswordHash::new(hash.as_phc()) {
            Ok(parsed) => self.argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }

    pub fn verify(&self, store: &dyn PrincipalStore, identity: &str, candidate: &str) -> bool {
        self.authenticate(store, identity, candidate).is_ok()
    }

    /// Principal for `identity` if `candidate` matches its secret, `InvalidCredential` otherwise.
    pub fn authenticate(&self, store: &dyn PrincipalStore, identity: &str, candidate: &str) -> Result<Principal, AuthError> {
        let record = store.find_principal_by_identity(identity)?;
        match record {
            Some(rec) => {
                if self.verify_password(&rec.secret_hash, candidate) {
                    Ok(rec.principal)
                } else {
                    Err(AuthError::InvalidCredential)
                }
            }
            None => {
                let _ = self.verify_password(&self.dummy, candidate);
                Err(AuthError::InvalidCredential)
            }
        }
    }
}

fn hash_with(argon2: &Argon2<'static>, password: &str) -> Result<SecretHash> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(SecretHash::from_phc(phc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn seeded() -> (CredentialVerifier, MemoryStore) {
        let v = CredentialVerifier::insecure_fast().unwrap();
        let store = MemoryStore::new();
        let h = v.hash_password("pw1").unwrap();
        store.insert_principal("a@x.com", h).unwrap();
        (v, store)
    }

    #[test]
    fn hashes_are_salted_argon2id_phc() {
        let v = CredentialVerifier::insecure_fast().unwrap();
        let a = v.hash_password("same").unwrap();
        let b = v.hash_password("same").unwrap();
        assert!(a.as_phc().starts_with("$argon2id$"));
        assert_ne!(a, b);
        assert!(v.verify_password(&a, "same"));
        assert!(v.verify_password(&b, "same"));
        assert!(!v.verify_password(&a, "other"));
    }

    #[test]
    fn corrupt_hash_never_matches() {
        let v = CredentialVerifier::insecure_fast().unwrap();
        assert!(!v.verify_password(&SecretHash::from_phc("not-a-phc".into()), "x"));
    }

    #[test]
    fn verify_known_and_unknown() {
        let (v, store) = seeded();
        assert!(v.verify(&store, "a@x.com", "pw1"));
        assert!(!v.verify(&store, "a@x.com", "wrong"));
        assert!(!v.verify(&store, "ghost@x.com", "pw1"));
        assert!(!v.verify(&store, "ghost@x.com", ""));
    }

    #[test]
    fn unknown_and_wrong_secret_are_indistinguishable() {
        let (v, store) = seeded();
        let wrong = v.authenticate(&store, "a@x.com", "nope").unwrap_err();
        let unknown = v.authenticate(&store, "ghost@x.com", "nope").unwrap_err();
        assert_eq!(wrong, unknown);
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[test]
    fn dummy_hash_uses_same_parameters() {
        let (v, _store) = seeded();
        let real = v.hash_password("pw").unwrap();
        let params = |h: &SecretHash| h.as_phc().split('$').nth(3).map(str::to_string);
        assert_eq!(params(&v.dummy), params(&real));
    }
}

//! Principal storage collaborator.
//!
//! `PrincipalStore` is the seam to whatever persists user records; `MemoryStore` is the bundled
//! implementation. Request handlers never hold the store directly: they take a `StoreSession`
//! from `SharedStore::session()` at request start and the session is released when dropped, on
//! success, error or cancellation alike.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::identity::{Principal, PrincipalRecord, SecretHash};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity already exists: {0}")]
    Duplicate(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub trait PrincipalStore: Send + Sync {
    fn find_principal_by_identity(&self, identity: &str) -> Result<Option<PrincipalRecord>, StoreError>;

    /// Insert a new active principal. Fails with `Duplicate` if the identity exists; the check and
    /// the insert are atomic.
    fn insert_principal(&self, identity: &str, secret_hash: SecretHash) -> Result<Principal, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, PrincipalRecord>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Administrative toggle; not reachable over HTTP.
    pub fn set_active(&self, identity: &str, active: bool) -> bool {
        match self.users.write().get_mut(identity) {
            Some(rec) => { rec.principal.is_active = active; true }
            None => false,
        }
    }

    /// Administrative removal; not reachable over HTTP.
    pub fn remove(&self, identity: &str) -> bool {
        self.users.write().remove(identity).is_some()
    }

    pub fn len(&self) -> usize { self.users.read().len() }

    pub fn is_empty(&self) -> bool { self.users.read().is_empty() }
}

impl PrincipalStore for MemoryStore {
    fn find_principal_by_identity(&self, identity: &str) -> Result<Option<PrincipalRecord>, StoreError> {
        Ok(self.users.read().get(identity).cloned())
    }

    fn insert_principal(&self, identity: &str, secret_hash: SecretHash) -> Result<Principal, StoreError> {
        let mut users = self.users.write();
        if users.contains_key(identity) {
            return Err(StoreError::Duplicate(identity.to_string()));
        }
        let principal = Principal {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            identity: identity.to_string(),
            is_active: true,
        };
        users.insert(identity.to_string(), PrincipalRecord { principal: principal.clone(), secret_hash });
        Ok(principal)
    }
}

/// Process-wide handle to the store that hands out request-scoped sessions.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<dyn PrincipalStore>,
    open: Arc<AtomicUsize>,
}

impl SharedStore {
    pub fn new(store: Arc<dyn PrincipalStore>) -> Self {
        Self { inner: store, open: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn in_memory() -> (Self, Arc<MemoryStore>) {
        let mem = Arc::new(MemoryStore::new());
        (Self::new(mem.clone()), mem)
    }

    pub fn session(&self) -> StoreSession {
        let n = self.open.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: "storage", open_sessions = n, "session acquired");
        StoreSession { store: self.inner.clone(), open: self.open.clone() }
    }

    /// Sessions acquired and not yet released.
    pub fn open_sessions(&self) -> usize { self.open.load(Ordering::Acquire) }
}

/// A request's handle on the store; released on drop.
pub struct StoreSession {
    store: Arc<dyn PrincipalStore>,
    open: Arc<AtomicUsize>,
}

impl Deref for StoreSession {
    type Target = dyn PrincipalStore;
    fn deref(&self) -> &Self::Target { self.store.as_ref() }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        let n = self.open.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(target: "storage", open_sessions = n, "session released");
    }
}

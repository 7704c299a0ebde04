use arabica_protocol::Did;
use std::collections::BTreeSet;
use std::sync::RwLock;

/// Identities the application has signed up. The consumer indexes traffic
/// from these even before the index has seen them.
pub trait IdentityRegistry: Send + Sync {
    fn is_registered(&self, did: &Did) -> bool;

    fn registered(&self) -> Vec<Did>;
}

#[derive(Debug, Default)]
pub struct RegisteredIdentities {
    inner: RwLock<BTreeSet<Did>>,
}

impl RegisteredIdentities {
    pub fn new(dids: impl IntoIterator<Item = Did>) -> Self {
        Self {
            inner: RwLock::new(dids.into_iter().collect()),
        }
    }

    /// Returns true when the identity was not registered before.
    pub fn register(&self, did: Did) -> bool {
        match self.inner.write() {
            Ok(mut guard) => guard.insert(did),
            Err(poisoned) => poisoned.into_inner().insert(did),
        }
    }

    pub fn unregister(&self, did: &Did) -> bool {
        match self.inner.write() {
            Ok(mut guard) => guard.remove(did),
            Err(poisoned) => poisoned.into_inner().remove(did),
        }
    }
}

impl IdentityRegistry for RegisteredIdentities {
    fn is_registered(&self, did: &Did) -> bool {
        match self.inner.read() {
            Ok(guard) => guard.contains(did),
            Err(poisoned) => poisoned.into_inner().contains(did),
        }
    }

    fn registered(&self) -> Vec<Did> {
        match self.inner.read() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

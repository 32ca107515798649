//! Mapping from device identity to its active session.
//!
//! The registry is the only state shared between discovery callbacks and
//! session teardown. Every operation takes the same lock, so a
//! check-and-insert for one identity can never interleave with another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::session::PeripheralSession;
use crate::transport::{DeviceIdentity, Peripheral};

/// At most one active session per device identity.
pub struct SessionRegistry<P> {
    sessions: Mutex<HashMap<DeviceIdentity, Arc<PeripheralSession<P>>>>,
}

impl<P: Peripheral> SessionRegistry<P> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, Arc<PeripheralSession<P>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` under `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyActive`] if the identity already has a
    /// session; the existing entry is left untouched.
    pub fn register(
        &self,
        identity: DeviceIdentity,
        session: Arc<PeripheralSession<P>>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.lock();
        if sessions.contains_key(&identity) {
            return Err(RegistryError::AlreadyActive { identity });
        }
        debug!(device = %identity, session = %session.id(), "Registered session");
        sessions.insert(identity, session);
        Ok(())
    }

    /// Remove the entry for `identity`. Removing an absent identity is a
    /// no-op.
    pub fn unregister(&self, identity: &DeviceIdentity) -> Option<Arc<PeripheralSession<P>>> {
        self.lock().remove(identity)
    }

    /// Remove the entry for `identity` only if it is the session `session_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unregister_session(&self, identity: &DeviceIdentity, session_id: Uuid) -> bool {
        let mut sessions = self.lock();
        match sessions.get(identity) {
            Some(current) if current.id() == session_id => {
                sessions.remove(identity);
                debug!(device = %identity, session = %session_id, "Unregistered session");
                true
            }
            _ => false,
        }
    }

    /// The active session for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &DeviceIdentity) -> Option<Arc<PeripheralSession<P>>> {
        self.lock().get(identity).cloned()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every active session.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<PeripheralSession<P>>> {
        self.lock().values().cloned().collect()
    }
}

impl<P: Peripheral> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_session, MockPeripheral};

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, "cc2650")
    }

    #[tokio::test]
    async fn test_register_rejects_second_session() {
        let registry = Arc::new(SessionRegistry::<MockPeripheral>::new());
        let first = test_session(&registry, identity("AA:BB"), MockPeripheral::new());
        let second = test_session(&registry, identity("AA:BB"), MockPeripheral::new());

        registry.register(identity("AA:BB"), first.clone()).unwrap();
        let err = registry
            .register(identity("AA:BB"), second)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyActive {
                identity: identity("AA:BB")
            }
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup(&identity("AA:BB")).unwrap().id(),
            first.id()
        );
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = Arc::new(SessionRegistry::<MockPeripheral>::new());
        let session = test_session(&registry, identity("AA:BB"), MockPeripheral::new());
        registry.register(identity("AA:BB"), session).unwrap();

        assert!(registry.unregister(&identity("AA:BB")).is_some());
        assert!(registry.unregister(&identity("AA:BB")).is_none());
        assert!(registry.lookup(&identity("AA:BB")).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_session_keeps_newer_entry() {
        let registry = Arc::new(SessionRegistry::<MockPeripheral>::new());
        let stale = test_session(&registry, identity("AA:BB"), MockPeripheral::new());
        let current = test_session(&registry, identity("AA:BB"), MockPeripheral::new());
        registry.register(identity("AA:BB"), current.clone()).unwrap();

        assert!(!registry.unregister_session(&identity("AA:BB"), stale.id()));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister_session(&identity("AA:BB"), current.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_admits_exactly_one() {
        let registry = Arc::new(SessionRegistry::<MockPeripheral>::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let session = test_session(&registry, identity("AA:BB"), MockPeripheral::new());
                registry.register(identity("AA:BB"), session).is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }
}

//! Registry of live connections.
//!
//! The [`Registry`] records which identities currently hold a connection and
//! enforces a process-wide capacity. It never owns the transport: entries are
//! presence markers (the accept time) keyed by [`ConnectionIdentity`].
//!
//! All state sits behind one mutex so the duplicate check, the capacity check
//! and the insert in [`Registry::try_register`] are a single atomic step.
//! [`Registry::exists`] and [`Registry::has_reached_limit`] are advisory reads;
//! only `try_register` decides.

use super::identity::ConnectionIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Reasons a registration is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("identity already connected")]
    Duplicate,

    #[error("connection capacity reached")]
    CapacityReached,
}

/// Connection registry with a fixed capacity.
pub struct Registry {
    connections: Mutex<HashMap<ConnectionIdentity, Instant>>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True iff the identity is currently registered.
    pub fn exists(&self, identity: &ConnectionIdentity) -> bool {
        self.connections.lock().contains_key(identity)
    }

    /// True iff the registry is full.
    pub fn has_reached_limit(&self) -> bool {
        self.connections.lock().len() >= self.capacity
    }

    /// Register an identity if it is not already present and capacity remains.
    ///
    /// Duplicates are reported before capacity, so a reconnecting identity on a
    /// full server is told it is already connected.
    pub fn try_register(&self, identity: &ConnectionIdentity) -> Result<(), RegistryError> {
        let mut connections = self.connections.lock();

        if connections.contains_key(identity) {
            return Err(RegistryError::Duplicate);
        }
        if connections.len() >= self.capacity {
            return Err(RegistryError::CapacityReached);
        }

        connections.insert(identity.clone(), Instant::now());
        debug!(
            conn_id = %identity.id,
            conn_group = %identity.group,
            total = connections.len(),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove an identity. Removing an absent identity is a no-op.
    pub fn remove(&self, identity: &ConnectionIdentity) {
        let mut connections = self.connections.lock();
        if connections.remove(identity).is_some() {
            debug!(
                conn_id = %identity.id,
                conn_group = %identity.group,
                total = connections.len(),
                "Connection removed"
            );
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live connections per group.
    pub fn count_by_group(&self) -> HashMap<String, usize> {
        let connections = self.connections.lock();
        let mut counts = HashMap::new();
        for identity in connections.keys() {
            *counts.entry(identity.group.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn id(id: &str, group: &str) -> ConnectionIdentity {
        ConnectionIdentity::new(id, group)
    }

    #[test]
    fn test_register_and_exists() {
        let registry = Registry::new(10);
        assert!(!registry.exists(&id("a", "g")));

        registry.try_register(&id("a", "g")).unwrap();
        assert!(registry.exists(&id("a", "g")));
        assert!(!registry.exists(&id("a", "other")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = Registry::new(10);
        registry.try_register(&id("a", "g")).unwrap();

        assert_eq!(
            registry.try_register(&id("a", "g")),
            Err(RegistryError::Duplicate)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = Registry::new(2);
        registry.try_register(&id("a", "g")).unwrap();
        registry.try_register(&id("b", "g")).unwrap();
        assert!(registry.has_reached_limit());

        assert_eq!(
            registry.try_register(&id("c", "g")),
            Err(RegistryError::CapacityReached)
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_reported_before_capacity() {
        let registry = Registry::new(1);
        registry.try_register(&id("a", "g")).unwrap();

        assert_eq!(
            registry.try_register(&id("a", "g")),
            Err(RegistryError::Duplicate)
        );
        assert_eq!(
            registry.try_register(&id("b", "g")),
            Err(RegistryError::CapacityReached)
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new(1);
        registry.try_register(&id("a", "g")).unwrap();

        registry.remove(&id("a", "g"));
        registry.remove(&id("a", "g"));
        registry.remove(&id("never", "seen"));

        assert!(registry.is_empty());
        registry.try_register(&id("a", "g")).unwrap();
    }

    #[test]
    fn test_count_by_group() {
        let registry = Registry::new(10);
        registry.try_register(&id("a", "viewer")).unwrap();
        registry.try_register(&id("b", "viewer")).unwrap();
        registry.try_register(&id("c", "driver")).unwrap();

        let counts = registry.count_by_group();
        assert_eq!(counts.get("viewer"), Some(&2));
        assert_eq!(counts.get("driver"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_concurrent_registrations_never_exceed_capacity() {
        let capacity = 16;
        let registry = Arc::new(Registry::new(capacity));
        let accepted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                let accepted = accepted.clone();
                thread::spawn(move || {
                    if registry.try_register(&id(&format!("user-{}", i), "g")).is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                    assert!(registry.len() <= capacity);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), capacity);
        assert_eq!(registry.len(), capacity);
    }

    #[test]
    fn test_concurrent_same_identity_registers_once() {
        let registry = Arc::new(Registry::new(100));
        let accepted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let accepted = accepted.clone();
                thread::spawn(move || {
                    if registry.try_register(&id("same", "g")).is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_register_remove_nets_out() {
        let registry = Arc::new(Registry::new(1000));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let identity = id(&format!("w{}-{}", worker, i), "g");
                        registry.try_register(&identity).unwrap();
                        if i % 2 == 0 {
                            registry.remove(&identity);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 50);
    }
}

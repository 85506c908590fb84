//! At most one in-flight recovery per target.
//!
//! Locks are process-local and never block: a caller that loses the race is told
//! so immediately. [`RecoveryGuard`] releases its key when dropped, including
//! during unwinding.

use crate::models::{Notification, NotificationType};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What a recovery is serialized on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Host(String),
    Instance(String),
}

impl TargetKey {
    /// `COMPUTE_HOST` and `PROCESS` lock the source host; `VM` locks the instance.
    /// `None` when a VM notification carries no instance id.
    pub fn for_notification(notification: &Notification) -> Option<Self> {
        match notification.notification_type {
            NotificationType::ComputeHost | NotificationType::Process => {
                Some(TargetKey::Host(notification.source_host_name.clone()))
            }
            NotificationType::Vm => notification.instance_uuid().map(|id| TargetKey::Instance(id.to_string())),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Host(name) => write!(f, "host:{name}"),
            TargetKey::Instance(id) => write!(f, "instance:{id}"),
        }
    }
}

#[derive(Clone, Default)]
pub struct LockCoordinator {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `key` if free. Returns false without waiting when it is already held.
    pub fn acquire(&self, key: &str) -> bool {
        let acquired = self.held.lock().insert(key.to_string());
        debug!(key, acquired, "recovery lock acquire");
        acquired
    }

    /// Releasing a key that is not held is a no-op
    pub fn release(&self, key: &str) {
        if self.held.lock().remove(key) {
            debug!(key, "recovery lock released");
        }
    }

    pub fn try_lock(&self, key: &TargetKey) -> Option<RecoveryGuard> {
        self.guard(key.to_string())
    }

    /// Scoped form of [`acquire`](Self::acquire) for an arbitrary key
    pub fn guard(&self, key: impl Into<String>) -> Option<RecoveryGuard> {
        let key = key.into();
        self.acquire(&key).then(|| RecoveryGuard { coordinator: self.clone(), key })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    /// Currently held keys, sorted
    pub fn held(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held.lock().iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RecoveryGuard {
    coordinator: LockCoordinator,
    key: String,
}

impl RecoveryGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.coordinator.release(&self.key);
    }
}

impl fmt::Debug for RecoveryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecoveryGuard").field(&self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_acquire_is_exclusive() {
        let locks = LockCoordinator::new();
        assert!(locks.acquire("host:a"));
        assert!(!locks.acquire("host:a"));
        assert!(locks.acquire("host:b"));

        locks.release("host:a");
        locks.release("host:a");
        assert!(locks.acquire("host:a"));
        assert_eq!(locks.held(), vec!["host:a", "host:b"]);
    }

    #[test]
    fn test_guard_releases_on_drop_and_panic() {
        let locks = LockCoordinator::new();
        let key = TargetKey::Host("compute-1".into());

        let guard = locks.try_lock(&key).unwrap();
        assert_eq!(guard.key(), "host:compute-1");
        assert!(locks.try_lock(&key).is_none());
        drop(guard);
        assert!(!locks.is_held("host:compute-1"));

        let cloned = locks.clone();
        let k = key.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_lock(&k).unwrap();
            panic!("recovery blew up");
        }));
        assert!(result.is_err());
        assert!(locks.held().is_empty());
    }

    #[test]
    fn test_target_keys() {
        let host = Notification::new("compute-1", NotificationType::ComputeHost, json!({}));
        assert_eq!(TargetKey::for_notification(&host).unwrap().to_string(), "host:compute-1");

        let process = Notification::new("compute-1", NotificationType::Process, json!({"process_name": "nova-compute"}));
        assert_eq!(TargetKey::for_notification(&process), Some(TargetKey::Host("compute-1".into())));

        let vm = Notification::new("compute-1", NotificationType::Vm, json!({"instance_uuid": "vm-9"}));
        assert_eq!(TargetKey::for_notification(&vm).unwrap().to_string(), "instance:vm-9");

        let anonymous_vm = Notification::new("compute-1", NotificationType::Vm, json!({}));
        assert_eq!(TargetKey::for_notification(&anonymous_vm), None);
    }

    #[test]
    fn test_only_one_of_many_threads_wins() {
        let locks = LockCoordinator::new();
        let winners = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16).map(|_| s.spawn(|| locks.acquire("instance:vm-1"))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count()
        });
        assert_eq!(winners, 1);
        assert!(locks.is_held("instance:vm-1"));
    }
}

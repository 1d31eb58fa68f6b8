//! Keyed exclusive locks for servers and deployments.
//!
//! Each table lazily creates one `tokio::sync::Mutex` per key. The table
//! itself is guarded by a short std mutex held only while looking up or
//! inserting a handle, so locks for different keys never block each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// A lazily-populated map of key → exclusive lock.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Drop the entry for `key` unless someone still holds or awaits it.
    fn cleanup(&self, key: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(key) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Two independent keyed-lock tables: one per server, one per deployment.
#[derive(Default)]
pub struct MutexManager {
    servers: KeyedLocks,
    deployments: KeyedLocks,
}

impl MutexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the server's lock.
    ///
    /// The guard is dropped on every exit path, including early returns
    /// and errors inside `f`.
    pub async fn with_server_lock<F, Fut, T>(&self, server_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.servers.acquire(server_id).await;
        f().await
    }

    /// Run `f` while holding the deployment's lock.
    pub async fn with_deployment_lock<F, Fut, T>(&self, deployment_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.deployments.acquire(deployment_id).await;
        f().await
    }

    /// Acquire the server's lock as an owned guard.
    pub async fn lock_server(&self, server_id: &str) -> OwnedMutexGuard<()> {
        self.servers.acquire(server_id).await
    }

    /// Acquire the deployment's lock as an owned guard.
    pub async fn lock_deployment(&self, deployment_id: &str) -> OwnedMutexGuard<()> {
        self.deployments.acquire(deployment_id).await
    }

    /// Forget a server's lock once its connection lifecycle has ended.
    ///
    /// Entries that are currently held or awaited are kept.
    pub fn cleanup_server_mutex(&self, server_id: &str) -> bool {
        let removed = self.servers.cleanup(server_id);
        if removed {
            debug!(%server_id, "server mutex released");
        }
        removed
    }

    /// Forget a deployment's lock after uninstall.
    pub fn cleanup_deployment_mutex(&self, deployment_id: &str) -> bool {
        let removed = self.deployments.cleanup(deployment_id);
        if removed {
            debug!(%deployment_id, "deployment mutex released");
        }
        removed
    }

    pub fn server_lock_count(&self) -> usize {
        self.servers.len()
    }

    pub fn deployment_lock_count(&self) -> usize {
        self.deployments.len()
    }
}

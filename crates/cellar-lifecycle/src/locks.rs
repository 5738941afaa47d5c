use cellar_common::base_container_name;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Named async mutexes, one per base container.
///
/// Snapshots are addressed by name prefix, so a container and all of its
/// snapshots share one lock: creating, renaming or deleting any of them is
/// serialized against the others.
#[derive(Clone, Default)]
pub struct ContainerLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ContainerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let key = base_container_name(name).to_string();
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        debug!(container = %key, "Waiting for container lock");
        mutex.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_snapshot_shares_parent_lock() {
        let locks = ContainerLocks::new();
        let guard = locks.lock("web").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock("web/snap0")).await;
        assert!(blocked.is_err());

        // Unrelated containers are independent.
        let _other = tokio::time::timeout(Duration::from_millis(50), locks.lock("db"))
            .await
            .unwrap();

        drop(guard);
        let _snap = locks.lock("web/snap0").await;
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = ContainerLocks::new();
        let held = locks.lock("web").await;
        drop(locks.lock("db").await);
        locks.prune();
        assert_eq!(locks.locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.locks.is_empty());
    }
}

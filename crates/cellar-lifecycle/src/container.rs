use cellar_common::{CellarError, Result, SNAPSHOT_DELIMITER};
use tracing::{debug, info, instrument, warn};

use crate::context::LifecycleContext;
use crate::operations::Operation;
use crate::snapshot::container_url;
use crate::storage::{path_exists, remove_all, BackingFs};

impl LifecycleContext {
    /// Starts a container and, for ephemeral ones, arms the delete-on-stop
    /// watcher.
    #[instrument(skip(self))]
    pub async fn start_container(&self, name: &str) -> Result<()> {
        let record = self.load_container(name).await?;
        if record.is_snapshot() {
            return Err(CellarError::BadRequest(format!(
                "cannot start snapshot {name}"
            )));
        }
        self.runtime.start(name).await?;
        if record.ephemeral {
            self.watch_ephemeral(name);
        }
        info!(container = %name, "Container started");
        Ok(())
    }

    /// Deletes a container together with every snapshot under it.
    #[instrument(skip(self))]
    pub async fn delete_container(&self, name: &str) -> Result<Operation> {
        let record = self.load_container(name).await?;
        if record.is_snapshot() {
            return self.delete_snapshot(name).await;
        }

        let ctx = self.clone();
        let name = name.to_string();
        Ok(self.operations.submit(
            format!("Deleting container {name}"),
            vec![container_url(&name)],
            move |progress| async move {
                let _guard = ctx.locks.lock(&name).await;
                progress.update("Removing snapshots");
                ctx.remove_container_locked(&name).await
            },
        ))
    }

    /// Caller holds the container lock.
    pub(crate) async fn remove_container_locked(&self, name: &str) -> Result<()> {
        let record = self.load_container(name).await?;
        if self.runtime.is_running(name).await {
            return Err(CellarError::InvalidState(format!(
                "container {name} is running"
            )));
        }

        self.delete_snapshots_locked(name).await?;
        self.storage.delete(&record).await?;
        self.db.delete_container(record.id).await?;
        info!(container = %name, "Container deleted");
        Ok(())
    }

    /// Removes every snapshot of `parent`, filesystem first, then the rows in
    /// one batch. Returns how many snapshots were removed.
    pub async fn delete_snapshots(&self, parent: &str) -> Result<usize> {
        let _guard = self.locks.lock(parent).await;
        self.delete_snapshots_locked(parent).await
    }

    /// Rows whose location could not be cleaned are left in place so a later
    /// run retries them; the call then fails after committing the rest.
    async fn delete_snapshots_locked(&self, parent: &str) -> Result<usize> {
        let prefix = format!("{parent}{SNAPSHOT_DELIMITER}");
        let snapshots = self.db.snapshots_with_prefix(&prefix).await?;
        if snapshots.is_empty() {
            return Ok(0);
        }

        let parent_path = self.layout.container_path(parent);
        let backing = match self.storage.detect_backing_fs(&parent_path).await {
            Ok(fs) => fs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BackingFs::Other,
            Err(e) => {
                return Err(CellarError::Storage(format!(
                    "inspecting {}: {e}",
                    parent_path.display()
                )))
            }
        };
        debug!(container = %parent, ?backing, count = snapshots.len(), "Deleting snapshots");

        let mut removed = Vec::with_capacity(snapshots.len());
        let mut failed = Vec::new();
        for (name, id) in snapshots {
            let path = self.layout.container_path(&name);
            if backing.supports_subvolumes() {
                let rootfs = self.layout.rootfs_path(&name);
                // Plain directories on btrfs fail here; remove_all covers them.
                if path_exists(&rootfs).await {
                    if let Err(e) = self.storage.delete_subvolume(&rootfs).await {
                        debug!(snapshot = %name, error = %e, "Subvolume delete failed");
                    }
                }
            }
            match remove_all(&path).await {
                Ok(()) => removed.push(id),
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Failed to remove snapshot location");
                    failed.push(name);
                }
            }
        }

        let count = removed.len();
        self.db.delete_containers(removed).await?;
        if !failed.is_empty() {
            return Err(CellarError::Storage(format!(
                "could not remove snapshots: {}",
                failed.join(", ")
            )));
        }
        Ok(count)
    }
}

use async_trait::async_trait;
use cellar_common::{CellarError, ContainerRecord, Result};
use tokio::fs;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use super::{copy_dir_recursive, path_exists, remove_all, storage_err, StorageBackend};
use crate::layout::Layout;

/// Btrfs storage: `rootfs` is a subvolume and snapshots are subvolume snapshots.
pub struct BtrfsStorage {
    layout: Layout,
}

impl BtrfsStorage {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StorageBackend for BtrfsStorage {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn snapshot_create(&self, dst: &ContainerRecord, src: &ContainerRecord) -> Result<()> {
        let from = self.layout.container_path(&src.name);
        let to = self.layout.container_path(&dst.name);
        fs::create_dir_all(&to)
            .await
            .map_err(|e| storage_err(format!("creating {}", to.display()), e))?;

        let mut cmd = AsyncCommand::new("btrfs");
        cmd.arg("subvolume")
            .arg("snapshot")
            .arg(from.join("rootfs"))
            .arg(to.join("rootfs"));
        debug!("btrfs snapshot command: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| storage_err("spawning btrfs", e))?;
        if !output.status.success() {
            return Err(CellarError::Storage(format!(
                "btrfs subvolume snapshot failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Everything beside rootfs is small; copy it.
        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| storage_err(format!("reading {}", from.display()), e))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name == "rootfs" {
                continue;
            }
            let target = to.join(&name);
            if entry.file_type().await?.is_dir() {
                copy_dir_recursive(&entry.path(), &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }

        info!(src = %src.name, dst = %dst.name, "Created btrfs snapshot");
        Ok(())
    }

    async fn delete(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.layout.container_path(&record.name);
        let rootfs = path.join("rootfs");
        if path_exists(&rootfs).await {
            self.delete_subvolume(&rootfs).await?;
        }
        remove_all(&path)
            .await
            .map_err(|e| storage_err(format!("removing {}", path.display()), e))?;
        info!(container = %record.name, "Removed btrfs storage");
        Ok(())
    }
}

//! Filesystem-level snapshot and delete primitives.
//!
//! Backends resolve record names to paths through [`Layout`]; callers only
//! ever hand them records.

mod btrfs;
mod copy;
mod detect;
mod dir;

pub use btrfs::BtrfsStorage;
pub use detect::{detect_backing_fs, BackingFs};
pub use dir::DirStorage;

use async_trait::async_trait;
use cellar_common::{CellarError, ContainerRecord, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::layout::Layout;

/// Abstract container storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn layout(&self) -> &Layout;

    /// Materialize `src`'s filesystem at `dst`'s location.
    async fn snapshot_create(&self, dst: &ContainerRecord, src: &ContainerRecord) -> Result<()>;

    /// Remove a record's on-disk location. Missing locations are not an error.
    async fn delete(&self, record: &ContainerRecord) -> Result<()>;

    /// Move a container's location after its name changed.
    async fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let from = self.layout().container_path(old_name);
        let to = self.layout().container_path(new_name);
        if !path_exists(&from).await {
            debug!(from = %from.display(), "Nothing on disk to rename");
            return Ok(());
        }
        if path_exists(&to).await {
            return Err(CellarError::Conflict(format!(
                "storage location {} already exists",
                to.display()
            )));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to)
            .await
            .map_err(|e| storage_err(format!("rename {} -> {}", from.display(), to.display()), e))
    }

    async fn detect_backing_fs(&self, path: &Path) -> std::io::Result<BackingFs> {
        detect_backing_fs(path).await
    }

    /// Delete a copy-on-write subvolume.
    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        btrfs_subvolume_delete(path).await
    }
}

/// Which backend the daemon should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    Auto,
    Dir,
    Btrfs,
}

/// Builds the configured backend; `Auto` looks at the var directory's filesystem.
pub async fn backend_for(driver: StorageDriver, layout: Layout) -> Arc<dyn StorageBackend> {
    let driver = match driver {
        StorageDriver::Auto => match detect_backing_fs(layout.var_dir()).await {
            Ok(BackingFs::Btrfs) => StorageDriver::Btrfs,
            _ => StorageDriver::Dir,
        },
        other => other,
    };
    match driver {
        StorageDriver::Btrfs => Arc::new(BtrfsStorage::new(layout)),
        _ => Arc::new(DirStorage::new(layout)),
    }
}

pub(crate) fn storage_err(context: impl std::fmt::Display, e: std::io::Error) -> CellarError {
    CellarError::Storage(format!("{context}: {e}"))
}

pub(crate) async fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

pub(crate) async fn btrfs_subvolume_delete(path: &Path) -> Result<()> {
    let output = AsyncCommand::new("btrfs")
        .arg("subvolume")
        .arg("delete")
        .arg(path)
        .output()
        .await
        .map_err(|e| storage_err("spawning btrfs", e))?;
    if !output.status.success() {
        return Err(CellarError::Storage(format!(
            "btrfs subvolume delete {} failed: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Replicates `src` at `dst` with owners, modes, mtimes, hardlinks and
/// special nodes intact. Existing entries under `dst` are kept.
pub(crate) async fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || copy::TreeCopy::default().run(&src, &dst))
        .await
        .map_err(std::io::Error::other)?
}

/// Remove a path whatever it is; missing paths are fine.
pub(crate) async fn remove_all(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

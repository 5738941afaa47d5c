use cellar_common::is_snapshot_name;
use std::path::{Path, PathBuf};

/// On-disk locations under the daemon's var directory.
///
/// ```text
/// <var>/containers/<name>/{metadata.yaml,rootfs,templates}
/// <var>/snapshots/<parent>/<leaf>/{rootfs,state}
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    var_dir: PathBuf,
}

impl Layout {
    pub fn new(var_dir: impl Into<PathBuf>) -> Self {
        Self {
            var_dir: var_dir.into(),
        }
    }

    pub fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.var_dir.join("containers")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.var_dir.join("snapshots")
    }

    pub fn container_path(&self, name: &str) -> PathBuf {
        if is_snapshot_name(name) {
            self.snapshots_dir().join(name)
        } else {
            self.containers_dir().join(name)
        }
    }

    pub fn rootfs_path(&self, name: &str) -> PathBuf {
        self.container_path(name).join("rootfs")
    }

    /// Checkpoint images of a stateful snapshot.
    pub fn state_dir(&self, name: &str) -> PathBuf {
        self.container_path(name).join("state")
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.containers_dir()).await?;
        tokio::fs::create_dir_all(self.snapshots_dir()).await
    }
}

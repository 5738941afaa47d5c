use async_trait::async_trait;
use cellar_common::{ContainerRecord, Result};
use tracing::info;

use super::{copy_dir_recursive, remove_all, storage_err, StorageBackend};
use crate::layout::Layout;

/// Plain-directory storage: snapshots are full copies.
pub struct DirStorage {
    layout: Layout,
}

impl DirStorage {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StorageBackend for DirStorage {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn snapshot_create(&self, dst: &ContainerRecord, src: &ContainerRecord) -> Result<()> {
        let from = self.layout.container_path(&src.name);
        let to = self.layout.container_path(&dst.name);
        copy_dir_recursive(&from, &to)
            .await
            .map_err(|e| storage_err(format!("copying {} to {}", from.display(), to.display()), e))?;
        info!(src = %src.name, dst = %dst.name, "Created directory snapshot");
        Ok(())
    }

    async fn delete(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.layout.container_path(&record.name);
        remove_all(&path)
            .await
            .map_err(|e| storage_err(format!("removing {}", path.display()), e))?;
        info!(container = %record.name, "Removed storage");
        Ok(())
    }
}

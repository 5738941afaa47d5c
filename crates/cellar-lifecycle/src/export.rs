//! Tar export of a container directory.
//!
//! Entries are written as `metadata.yaml`, then everything under `rootfs/`
//! in lexical order, then `templates/`. Ownership below `rootfs/` is mapped
//! back from the host range into container ids for unprivileged containers;
//! entries whose ids have no mapping are left out.

use cellar_common::{CellarError, Result};
use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::{debug, instrument};

use crate::context::LifecycleContext;
use crate::idmap::IdmapSet;

const ROOTFS: &str = "rootfs";

pub struct TarExporter {
    root: PathBuf,
    idmap: Option<Arc<IdmapSet>>,
}

struct ExportState<W: Write> {
    builder: Builder<W>,
    /// First archived path for each multiply-linked inode.
    links: HashMap<(u64, u64), PathBuf>,
}

impl TarExporter {
    /// `idmap` is `None` for privileged containers.
    pub fn new(root: impl Into<PathBuf>, idmap: Option<Arc<IdmapSet>>) -> Self {
        Self {
            root: root.into(),
            idmap,
        }
    }

    /// Streams the archive into `out` and hands it back once the archive
    /// trailer is written. Any I/O failure aborts the export.
    pub fn export<W: Write>(&self, out: W) -> Result<W> {
        let mut state = ExportState {
            builder: Builder::new(out),
            links: HashMap::new(),
        };

        let metadata = self.root.join("metadata.yaml");
        if let Some(meta) = optional_metadata(&metadata)? {
            self.store(&mut state, &metadata, &meta)?;
        }

        self.walk(&mut state, &self.root.join(ROOTFS))?;

        let templates = self.root.join("templates");
        if optional_metadata(&templates)?.is_some() {
            self.walk(&mut state, &templates)?;
        }

        Ok(state.builder.into_inner()?)
    }

    fn walk<W: Write>(&self, state: &mut ExportState<W>, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path)?;
        self.store(state, path, &meta)?;
        if !meta.is_dir() {
            return Ok(());
        }

        let mut children = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort();
        for child in children {
            self.walk(state, &child)?;
        }
        Ok(())
    }

    fn store<W: Write>(&self, state: &mut ExportState<W>, path: &Path, meta: &Metadata) -> Result<()> {
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            CellarError::Internal(format!("{} escapes the export root", path.display()))
        })?;
        let file_type = meta.file_type();

        let (mut uid, mut gid) = (meta.uid(), meta.gid());
        if let Some(idmap) = self.idmap.as_deref().filter(|_| rel.starts_with(ROOTFS)) {
            match idmap.shift_from_ns(uid, gid) {
                (Some(u), Some(g)) => (uid, gid) = (u, g),
                _ => {
                    debug!(path = %rel.display(), uid, gid, "Skipping entry with unmapped owner");
                    return Ok(());
                }
            }
        }

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(meta, HeaderMode::Complete);
        header.set_uid(uid.into());
        header.set_gid(gid.into());
        if file_type.is_dir() || file_type.is_symlink() {
            header.set_size(0);
        }
        if file_type.is_char_device() || file_type.is_block_device() {
            let rdev = meta.rdev();
            #[allow(unused_unsafe)]
            let (major, minor) = unsafe { (libc::major(rdev), libc::minor(rdev)) };
            header.set_device_major(major)?;
            header.set_device_minor(minor)?;
        }

        if file_type.is_file() && meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = state.links.get(&key) {
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                state.builder.append_link(&mut header, rel, first)?;
                return Ok(());
            }
            state.links.insert(key, rel.to_path_buf());
        }

        if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            state.builder.append_link(&mut header, rel, target)?;
        } else if file_type.is_file() {
            let data = ExactReader::new(File::open(path)?, header.size()?, path);
            state.builder.append_data(&mut header, rel, data)?;
        } else {
            state.builder.append_data(&mut header, rel, io::empty())?;
        }
        Ok(())
    }
}

fn optional_metadata(path: &Path) -> io::Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Yields exactly the byte count recorded in the entry header. A file that
/// grew is cut at that length; one that shrank fails the export.
struct ExactReader<R> {
    inner: io::Take<R>,
    path: PathBuf,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64, path: &Path) -> Self {
        Self {
            inner: inner.take(len),
            path: path.to_path_buf(),
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.inner.limit() > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank during export", self.path.display()),
            ));
        }
        Ok(n)
    }
}

impl LifecycleContext {
    /// Checks that `name` can be exported and returns an exporter for its
    /// directory. With `snapshot_label` set the export is meant to become an
    /// image, which needs a quiescent filesystem, so a running container is
    /// refused.
    #[instrument(skip(self))]
    pub async fn prepare_export(
        &self,
        name: &str,
        snapshot_label: Option<&str>,
    ) -> Result<TarExporter> {
        let record = self.load_container(name).await?;
        if snapshot_label.is_some() && self.runtime.is_running(name).await {
            return Err(CellarError::InvalidState(format!(
                "container {name} must be stopped to export a snapshot"
            )));
        }

        let idmap = (!record.is_privileged()).then(|| self.idmap.clone());
        Ok(TarExporter::new(self.layout.container_path(name), idmap))
    }

    /// Writes `name`'s directory as a tar stream into `out`.
    pub async fn export_container<W>(
        &self,
        name: &str,
        snapshot_label: Option<&str>,
        out: W,
    ) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let exporter = self.prepare_export(name, snapshot_label).await?;
        tokio::task::spawn_blocking(move || exporter.export(out))
            .await
            .map_err(|e| CellarError::Internal(format!("export task failed: {e}")))?
    }
}

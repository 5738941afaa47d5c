//! Tree replication for the directory backend.

use filetime::FileTime;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{lchown, symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Copies a tree keeping owners, modes, mtimes, symlinks, hardlinks and
/// special nodes. Existing entries under the destination root are kept.
#[derive(Default)]
pub(crate) struct TreeCopy {
    /// First destination path of each multiply-linked source inode.
    links: HashMap<(u64, u64), PathBuf>,
    /// Directory times are applied once all their children exist.
    dirs: Vec<(PathBuf, Metadata)>,
}

impl TreeCopy {
    pub(crate) fn run(mut self, src: &Path, dst: &Path) -> io::Result<()> {
        self.copy_dir(src, dst)?;
        for (path, meta) in &self.dirs {
            set_times(path, meta)?;
        }
        Ok(())
    }

    fn copy_dir(&mut self, src: &Path, dst: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(src)?;
        fs::create_dir_all(dst)?;

        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let child = fs::symlink_metadata(&from)?;
            if child.is_dir() {
                self.copy_dir(&from, &to)?;
            } else {
                self.copy_entry(&from, &to, &child)?;
            }
        }

        // Mode last so read-only directories can still be filled.
        lchown(dst, Some(meta.uid()), Some(meta.gid()))?;
        fs::set_permissions(dst, mode_of(&meta))?;
        self.dirs.push((dst.to_path_buf(), meta));
        Ok(())
    }

    fn copy_entry(&mut self, from: &Path, to: &Path, meta: &Metadata) -> io::Result<()> {
        if meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = self.links.get(&key) {
                return fs::hard_link(first, to);
            }
            self.links.insert(key, to.to_path_buf());
        }

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            symlink(fs::read_link(from)?, to)?;
        } else if file_type.is_file() {
            fs::copy(from, to)?;
        } else if file_type.is_fifo()
            || file_type.is_char_device()
            || file_type.is_block_device()
            || file_type.is_socket()
        {
            make_node(to, meta)?;
        } else {
            debug!(path = %from.display(), "Skipping entry of unknown type");
            return Ok(());
        }

        lchown(to, Some(meta.uid()), Some(meta.gid()))?;
        if !file_type.is_symlink() {
            // After chown, which clears setuid and setgid bits.
            fs::set_permissions(to, mode_of(meta))?;
        }
        set_times(to, meta)
    }
}

fn mode_of(meta: &Metadata) -> Permissions {
    Permissions::from_mode(meta.mode() & 0o7777)
}

fn set_times(path: &Path, meta: &Metadata) -> io::Result<()> {
    filetime::set_symlink_file_times(
        path,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
}

fn make_node(path: &Path, meta: &Metadata) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: c_path is a valid NUL-terminated string for the whole call.
    let rc = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            meta.mode() as libc::mode_t,
            meta.rdev() as libc::dev_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

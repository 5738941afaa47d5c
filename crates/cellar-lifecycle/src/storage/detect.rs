use serde::Serialize;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const BTRFS_SUPER_MAGIC: u64 = 0x9123_683E;
const ZFS_SUPER_MAGIC: u64 = 0x2FC1_2FC1;
const EXT4_SUPER_MAGIC: u64 = 0xEF53;
const XFS_SUPER_MAGIC: u64 = 0x5846_5342;
const TMPFS_MAGIC: u64 = 0x0102_1994;

/// Filesystem a path lives on, as far as storage decisions care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingFs {
    Btrfs,
    Zfs,
    Ext4,
    Xfs,
    Tmpfs,
    Other,
}

impl BackingFs {
    pub fn supports_subvolumes(self) -> bool {
        matches!(self, BackingFs::Btrfs)
    }

    fn from_magic(magic: u64) -> Self {
        match magic {
            BTRFS_SUPER_MAGIC => BackingFs::Btrfs,
            ZFS_SUPER_MAGIC => BackingFs::Zfs,
            EXT4_SUPER_MAGIC => BackingFs::Ext4,
            XFS_SUPER_MAGIC => BackingFs::Xfs,
            TMPFS_MAGIC => BackingFs::Tmpfs,
            _ => BackingFs::Other,
        }
    }
}

/// `statfs(2)` the path. A missing path yields `ErrorKind::NotFound`.
pub async fn detect_backing_fs(path: &Path) -> std::io::Result<BackingFs> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || statfs_magic(&path).map(BackingFs::from_magic))
        .await
        .map_err(std::io::Error::other)?
}

fn statfs_magic(path: &Path) -> std::io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut buf = std::mem::MaybeUninit::<libc::statfs>::zeroed();

    // SAFETY: c_path is NUL-terminated and buf is a valid, writable statfs.
    let rc = unsafe { libc::statfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: statfs returned 0, so buf was filled in.
    let stat = unsafe { buf.assume_init() };
    // f_type width differs per target.
    Ok(stat.f_type as u64 & 0xFFFF_FFFF)
}

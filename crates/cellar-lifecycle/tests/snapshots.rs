//! Snapshot create/list/rename/delete against a temp var dir with a fake runtime

use cellar_common::{CellarError, ContainerArgs, ErrorKind};
use cellar_lifecycle::test_utils::{RuntimeCall, TestHarness};
use cellar_lifecycle::{
    ContainerState, LifecycleConfig, NamingFailurePolicy, Operation, SnapshotCreated,
    SnapshotListing, SnapshotSummary,
};

async fn created(op: Operation) -> SnapshotCreated {
    let metadata = op.outcome().await.expect("operation failed").unwrap();
    serde_json::from_value(metadata).unwrap()
}

#[tokio::test]
async fn test_default_names_count_up() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;

    let first = created(h.ctx.create_snapshot("web", None, false).await.unwrap()).await;
    let second = created(h.ctx.create_snapshot("web", Some(""), false).await.unwrap()).await;

    assert_eq!(first.name, "snap0");
    assert_eq!(second.name, "snap1");
    assert_eq!(second.full_name, "web/snap1");

    let snap = h.layout.rootfs_path("web/snap1");
    assert_eq!(
        std::fs::read_to_string(snap.join("etc/hostname")).unwrap(),
        "web\n"
    );
}

#[tokio::test]
async fn test_snapshot_copies_parent_config_but_not_ephemeral() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    let mut args = ContainerArgs {
        ephemeral: true,
        ..Default::default()
    };
    args.config.insert("limits.cpu".into(), "2".into());
    h.seed_container("web", args).await;

    let snap = created(h.ctx.create_snapshot("web", Some("base"), false).await.unwrap()).await;
    let record = h.ctx.load_container(&snap.full_name).await.unwrap();

    assert!(record.is_snapshot());
    assert!(!record.ephemeral);
    assert_eq!(record.config.get("limits.cpu").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_unknown_parent_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;

    let err = h.ctx.create_snapshot("ghost", None, false).await.unwrap_err();
    assert!(matches!(err, CellarError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_leaf_is_rejected_before_any_work() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;

    for bad in ["a/b", "..", "."] {
        let err = h.ctx.create_snapshot("web", Some(bad), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest, "leaf {bad:?}");
    }
    assert!(h.ctx.list_snapshots("web", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;

    created(h.ctx.create_snapshot("web", Some("base"), false).await.unwrap()).await;
    let err = h
        .ctx
        .create_snapshot("web", Some("base"), false)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[tokio::test]
async fn test_stateful_snapshot_of_stopped_container_leaves_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;

    let err = h
        .ctx
        .create_snapshot("web", None, true)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(h.ctx.list_snapshots("web", 0).await.unwrap().is_empty());
    assert!(!h.layout.container_path("web/snap0").exists());
}

#[tokio::test]
async fn test_stateful_snapshot_checkpoints_and_stops_parent() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_running("web", ContainerArgs::default()).await;

    let snap = created(h.ctx.create_snapshot("web", None, true).await.unwrap()).await;

    let state_dir = h.layout.state_dir("web/snap0");
    assert!(state_dir.join("inventory.img").exists());
    assert!(h.runtime.calls().contains(&RuntimeCall::Checkpoint {
        name: "web".into(),
        dir: state_dir,
        stop: true,
    }));
    assert_eq!(h.runtime.state("web"), ContainerState::Stopped);

    let summary = h.ctx.get_snapshot("web", &snap.name).await.unwrap();
    assert!(summary.stateful);
}

#[tokio::test]
async fn test_failed_checkpoint_rolls_back_record() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_running("web", ContainerArgs::default()).await;
    h.runtime.fail_checkpoint(true);

    let err = h
        .ctx
        .create_snapshot("web", Some("live"), true)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(h.ctx.db.container_id("web/live").await.unwrap().is_none());
    assert!(!h.layout.container_path("web/live").exists());
}

#[tokio::test]
async fn test_storage_failure_rolls_back_record_and_partial_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;
    h.storage.fail_snapshots(true);

    let err = h
        .ctx
        .create_snapshot("web", None, false)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Storage);
    assert!(h.ctx.db.container_id("web/snap0").await.unwrap().is_none());
    assert!(!h.layout.container_path("web/snap0").exists());

    // The name is free again once the backend recovers.
    h.storage.fail_snapshots(false);
    let snap = created(h.ctx.create_snapshot("web", None, false).await.unwrap()).await;
    assert_eq!(snap.name, "snap0");
}

#[tokio::test]
async fn test_listing_by_recursion() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_running("web", ContainerArgs::default()).await;
    h.seed_container("web2", ContainerArgs::default()).await;

    created(h.ctx.create_snapshot("web", Some("live"), true).await.unwrap()).await;
    created(h.ctx.create_snapshot("web", Some("cold"), false).await.unwrap()).await;
    created(h.ctx.create_snapshot("web2", None, false).await.unwrap()).await;

    let refs = h.ctx.list_snapshots("web", 0).await.unwrap();
    assert_eq!(
        refs,
        SnapshotListing::References(vec![
            "/1.0/containers/web/snapshots/cold".into(),
            "/1.0/containers/web/snapshots/live".into(),
        ])
    );

    let full = h.ctx.list_snapshots("web", 1).await.unwrap();
    assert_eq!(
        full,
        SnapshotListing::Full(vec![
            SnapshotSummary {
                name: "cold".into(),
                stateful: false
            },
            SnapshotSummary {
                name: "live".into(),
                stateful: true
            },
        ])
    );

    let err = h.ctx.list_snapshots("ghost", 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_rename_moves_record_and_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;
    created(h.ctx.create_snapshot("web", None, false).await.unwrap()).await;
    created(h.ctx.create_snapshot("web", Some("keep"), false).await.unwrap()).await;

    let renamed = created(h.ctx.rename_snapshot("web/snap0", "before-upgrade").await.unwrap()).await;
    assert_eq!(renamed.full_name, "web/before-upgrade");
    assert!(h.ctx.db.container_id("web/snap0").await.unwrap().is_none());
    assert!(h.layout.rootfs_path("web/before-upgrade").join("etc/hostname").exists());
    assert!(!h.layout.container_path("web/snap0").exists());

    let err = h
        .ctx
        .rename_snapshot("web/before-upgrade", "keep")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    let err = h.ctx.rename_snapshot("web/keep", "x/y").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn test_delete_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;
    created(h.ctx.create_snapshot("web", None, false).await.unwrap()).await;

    h.ctx
        .delete_snapshot("web/snap0")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert!(h.ctx.db.container_id("web/snap0").await.unwrap().is_none());
    assert!(!h.layout.container_path("web/snap0").exists());
    assert!(h.layout.rootfs_path("web").exists());

    let err = h.ctx.delete_snapshot("web/snap0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_concurrent_default_names_do_not_collide() {
    let tmp = tempfile::tempdir().unwrap();
    let h = TestHarness::new(tmp.path()).await;
    h.seed_container("web", ContainerArgs::default()).await;

    let ctx = &h.ctx;
    let ops = futures::future::join_all((0..4).map(move |_| ctx.create_snapshot("web", None, false)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect::<Vec<_>>();
    let mut names = Vec::new();
    for op in ops {
        names.push(created(op).await.name);
    }
    names.sort();
    assert_eq!(names, ["snap0", "snap1", "snap2", "snap3"]);
}

#[tokio::test]
async fn test_naming_fallback_policy_is_configurable() {
    let tmp = tempfile::tempdir().unwrap();
    let config = LifecycleConfig {
        naming_failure_policy: NamingFailurePolicy::FallbackToZero,
        ..Default::default()
    };
    let h = TestHarness::with_config(tmp.path(), config).await;
    h.seed_container("web", ContainerArgs::default()).await;

    let snap = created(h.ctx.create_snapshot("web", None, false).await.unwrap()).await;
    assert_eq!(snap.name, "snap0");
}

mod replication {
    use super::*;
    use cellar_lifecycle::require_root;
    use filetime::FileTime;
    use std::ffi::CString;
    use std::io::Cursor;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{lchown, FileTypeExt, MetadataExt, PermissionsExt};
    use std::path::Path;
    use tar::{Archive, EntryType};

    fn mkfifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o640) }, 0);
    }

    /// Adds a hardlink pair, a symlink, a fifo and a read-only dir to `web`.
    fn enrich_rootfs(rootfs: &Path) {
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        std::fs::write(rootfs.join("bin/busybox"), "#!busybox").unwrap();
        std::fs::set_permissions(
            rootfs.join("bin/busybox"),
            std::fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        std::fs::hard_link(rootfs.join("bin/busybox"), rootfs.join("bin/sh")).unwrap();
        std::os::unix::fs::symlink("busybox", rootfs.join("bin/ls")).unwrap();
        mkfifo(&rootfs.join("initctl"));
        std::fs::create_dir_all(rootfs.join("ro")).unwrap();
        std::fs::write(rootfs.join("ro/motd"), "hi\n").unwrap();
        std::fs::set_permissions(rootfs.join("ro"), std::fs::Permissions::from_mode(0o555)).unwrap();

        let stamp = FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(rootfs.join("etc/hostname"), stamp).unwrap();
        filetime::set_file_mtime(rootfs.join("etc"), stamp).unwrap();
    }

    #[tokio::test]
    async fn test_dir_snapshot_keeps_links_nodes_modes_and_times() {
        let tmp = tempfile::tempdir().unwrap();
        let h = TestHarness::new(tmp.path()).await;
        h.seed_container("web", ContainerArgs::default()).await;
        let parent = h.layout.rootfs_path("web");
        enrich_rootfs(&parent);

        created(h.ctx.create_snapshot("web", Some("s"), false).await.unwrap()).await;
        let snap = h.layout.rootfs_path("web/s");

        let busybox = std::fs::metadata(snap.join("bin/busybox")).unwrap();
        let sh = std::fs::metadata(snap.join("bin/sh")).unwrap();
        assert_eq!(busybox.ino(), sh.ino());
        assert_eq!(busybox.nlink(), 2);
        assert_eq!(busybox.mode() & 0o7777, 0o750);
        assert_ne!(
            busybox.ino(),
            std::fs::metadata(parent.join("bin/busybox")).unwrap().ino()
        );

        assert_eq!(
            std::fs::read_link(snap.join("bin/ls")).unwrap(),
            Path::new("busybox")
        );
        let fifo = std::fs::symlink_metadata(snap.join("initctl")).unwrap();
        assert!(fifo.file_type().is_fifo());
        assert_eq!(fifo.mode() & 0o777, 0o640);

        let ro = std::fs::metadata(snap.join("ro")).unwrap();
        assert_eq!(ro.mode() & 0o777, 0o555);
        assert_eq!(std::fs::read_to_string(snap.join("ro/motd")).unwrap(), "hi\n");

        for rel in ["etc/hostname", "etc"] {
            let meta = std::fs::metadata(snap.join(rel)).unwrap();
            assert_eq!(
                FileTime::from_last_modification_time(&meta).unix_seconds(),
                1_500_000_000,
                "{rel}"
            );
        }
        let (src, dst) = (
            std::fs::metadata(parent.join("etc/hostname")).unwrap(),
            std::fs::metadata(snap.join("etc/hostname")).unwrap(),
        );
        assert_eq!((src.uid(), src.gid()), (dst.uid(), dst.gid()));

        // Let the temp dir clean up.
        std::fs::set_permissions(parent.join("ro"), std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(snap.join("ro"), std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[derive(Debug, PartialEq)]
    struct Entry {
        path: String,
        kind: EntryType,
        uid: u64,
        gid: u64,
        link: Option<String>,
    }

    fn entries(archive: Vec<u8>) -> Vec<Entry> {
        let mut archive = Archive::new(Cursor::new(archive));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let header = entry.header();
                Entry {
                    path: entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    kind: header.entry_type(),
                    uid: header.uid().unwrap(),
                    gid: header.gid().unwrap(),
                    link: entry
                        .link_name()
                        .unwrap()
                        .map(|l| l.to_string_lossy().into_owned()),
                }
            })
            .collect()
    }

    fn chown_tree(path: &Path, id: u32) {
        lchown(path, Some(id), Some(id)).unwrap();
        if std::fs::symlink_metadata(path).unwrap().is_dir() {
            for entry in std::fs::read_dir(path).unwrap() {
                chown_tree(&entry.unwrap().path(), id);
            }
        }
    }

    #[tokio::test]
    async fn test_shifted_snapshot_exports_like_its_parent() {
        require_root!();
        let tmp = tempfile::tempdir().unwrap();
        let h = TestHarness::new(tmp.path()).await;
        h.seed_container("web", ContainerArgs::default()).await;
        let parent = h.layout.rootfs_path("web");
        enrich_rootfs(&parent);
        std::fs::create_dir_all(parent.join("dev")).unwrap();
        let null = CString::new(parent.join("dev/null").as_os_str().as_bytes()).unwrap();
        #[allow(unused_unsafe)]
        let null_dev = unsafe { libc::makedev(1, 3) };
        assert_eq!(
            unsafe { libc::mknod(null.as_ptr(), libc::S_IFCHR | 0o666, null_dev) },
            0
        );
        // Host ids of the container's root under "b 0 100000 65536".
        chown_tree(&parent, 100_000);

        created(h.ctx.create_snapshot("web", Some("s"), false).await.unwrap()).await;
        let snap = h.layout.rootfs_path("web/s");
        let hostname = std::fs::metadata(snap.join("etc/hostname")).unwrap();
        assert_eq!((hostname.uid(), hostname.gid()), (100_000, 100_000));
        let dev = std::fs::symlink_metadata(snap.join("dev/null")).unwrap();
        assert!(dev.file_type().is_char_device());
        assert_eq!(dev.rdev(), null_dev);

        let parent_entries = entries(h.ctx.export_container("web", None, Vec::new()).await.unwrap());
        let snap_entries = entries(h.ctx.export_container("web/s", None, Vec::new()).await.unwrap());
        assert_eq!(parent_entries, snap_entries);

        let rootfs: Vec<&Entry> = snap_entries
            .iter()
            .filter(|e| e.path.starts_with("rootfs"))
            .collect();
        assert!(rootfs.len() > 8, "{rootfs:?}");
        assert!(rootfs.iter().all(|e| e.uid == 0 && e.gid == 0));

        let find = |p: &str| rootfs.iter().find(|e| e.path == p).unwrap();
        assert_eq!(find("rootfs/bin/sh").kind, EntryType::Link);
        assert_eq!(find("rootfs/bin/sh").link.as_deref(), Some("rootfs/bin/busybox"));
        assert_eq!(find("rootfs/bin/ls").kind, EntryType::Symlink);
        assert_eq!(find("rootfs/dev/null").kind, EntryType::Char);
        assert_eq!(find("rootfs/initctl").kind, EntryType::Fifo);
    }
}

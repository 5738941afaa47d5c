/// Test doubles and fixtures for lifecycle tests
use async_trait::async_trait;
use cellar_common::{CellarError, ContainerArgs, ContainerRecord, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::context::{LifecycleConfig, LifecycleContext};
use crate::db::Database;
use crate::idmap::IdmapSet;
use crate::layout::Layout;
use crate::operations::Operations;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::storage::{DirStorage, StorageBackend};

pub fn has_lxc() -> bool {
    cfg!(target_os = "linux")
        && Command::new("lxc-info")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Env var naming an existing, stopped LXC container the live tests may drive.
pub const LXC_TEST_CONTAINER_ENV: &str = "CELLAR_TEST_LXC_CONTAINER";
/// Env var overriding the LXC path that container lives under.
pub const LXC_TEST_PATH_ENV: &str = "CELLAR_TEST_LXC_PATH";

/// The container named by [`LXC_TEST_CONTAINER_ENV`] and its LXC path.
pub fn lxc_test_container() -> Option<(PathBuf, String)> {
    let name = std::env::var(LXC_TEST_CONTAINER_ENV).ok()?;
    let path = std::env::var(LXC_TEST_PATH_ENV).unwrap_or_else(|_| "/var/lib/lxc".to_string());
    Some((PathBuf::from(path), name))
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_lxc {
    () => {
        if !$crate::test_utils::has_lxc() || !$crate::test_utils::is_root() {
            eprintln!("Test ignored: LXC tools and root required");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_root {
    () => {
        if !$crate::test_utils::is_root() {
            eprintln!("Test ignored: root required");
            return;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
    Shutdown(String),
    Checkpoint { name: String, dir: PathBuf, stop: bool },
}

/// In-memory runtime. States are watch channels so `wait_for` observes
/// transitions made by the test.
#[derive(Default)]
pub struct FakeRuntime {
    states: Mutex<HashMap<String, watch::Sender<ContainerState>>>,
    calls: Mutex<Vec<RuntimeCall>>,
    failing_starts: Mutex<HashSet<String>>,
    fail_checkpoint: AtomicBool,
    shutdown_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<ContainerState> {
        let mut states = self.states.lock().unwrap();
        states
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(ContainerState::Stopped).0)
            .subscribe()
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        let mut states = self.states.lock().unwrap();
        states
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(ContainerState::Stopped).0)
            .send_replace(state);
    }

    pub fn state(&self, name: &str) -> ContainerState {
        *self.subscribe(name).borrow()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_start(&self, name: &str) {
        self.failing_starts.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_checkpoint(&self, fail: bool) {
        self.fail_checkpoint.store(fail, Ordering::SeqCst);
    }

    pub fn set_shutdown_delay(&self, delay: Duration) {
        *self.shutdown_delay.lock().unwrap() = delay;
    }

    /// Highest number of shutdowns observed running at the same time.
    pub fn max_concurrent_shutdowns(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_running(&self, name: &str) -> bool {
        self.state(name) == ContainerState::Running
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(RuntimeCall::Start(name.to_string()));
        if self.failing_starts.lock().unwrap().contains(name) {
            return Err(CellarError::Runtime(format!("{name} refused to start")));
        }
        self.set_state(name, ContainerState::Running);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(RuntimeCall::Stop(name.to_string()));
        if self.state(name) == ContainerState::Stopped {
            return Err(CellarError::Runtime(format!("{name} is not running")));
        }
        self.set_state(name, ContainerState::Stopped);
        Ok(())
    }

    async fn shutdown(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record(RuntimeCall::Shutdown(name.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.shutdown_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.set_state(name, ContainerState::Stopped);
        Ok(())
    }

    async fn checkpoint(&self, name: &str, directory: &Path, stop_after: bool) -> Result<()> {
        self.record(RuntimeCall::Checkpoint {
            name: name.to_string(),
            dir: directory.to_path_buf(),
            stop: stop_after,
        });
        if self.fail_checkpoint.load(Ordering::SeqCst) {
            return Err(CellarError::Runtime(format!("checkpoint of {name} failed")));
        }
        if self.state(name) != ContainerState::Running {
            return Err(CellarError::InvalidState(format!("{name} is not running")));
        }
        tokio::fs::write(directory.join("inventory.img"), name).await?;
        if stop_after {
            self.set_state(name, ContainerState::Stopped);
        }
        Ok(())
    }

    async fn wait_for(
        &self,
        name: &str,
        state: ContainerState,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let mut rx = self.subscribe(name);
        let reached = async move {
            let reached = rx.wait_for(|s| *s == state).await.is_ok();
            reached
        };
        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, reached).await.unwrap_or(false)),
            None => Ok(reached.await),
        }
    }
}

/// Wraps a real backend and fails on request.
pub struct FaultyStorage {
    inner: Arc<dyn StorageBackend>,
    fail_snapshot: AtomicBool,
    failing_deletes: Mutex<HashSet<String>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_snapshot: AtomicBool::new(false),
            failing_deletes: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, name: &str) {
        self.failing_deletes.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl StorageBackend for FaultyStorage {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn layout(&self) -> &Layout {
        self.inner.layout()
    }

    async fn snapshot_create(&self, dst: &ContainerRecord, src: &ContainerRecord) -> Result<()> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            // Leave a partial copy behind, like an interrupted backend would.
            tokio::fs::create_dir_all(self.layout().rootfs_path(&dst.name)).await?;
            return Err(CellarError::Storage(format!("injected failure copying {}", src.name)));
        }
        self.inner.snapshot_create(dst, src).await
    }

    async fn delete(&self, record: &ContainerRecord) -> Result<()> {
        if self.failing_deletes.lock().unwrap().contains(&record.name) {
            return Err(CellarError::Storage(format!("injected failure deleting {}", record.name)));
        }
        self.inner.delete(record).await
    }
}

/// A context over a temp var dir with a fake runtime and a dir backend.
pub struct TestHarness {
    pub ctx: LifecycleContext,
    pub runtime: Arc<FakeRuntime>,
    pub storage: Arc<FaultyStorage>,
    pub layout: Layout,
}

impl TestHarness {
    pub async fn new(var_dir: &Path) -> Self {
        Self::with_config(var_dir, LifecycleConfig::default()).await
    }

    pub async fn with_config(var_dir: &Path, config: LifecycleConfig) -> Self {
        let layout = Layout::new(var_dir);
        layout.ensure_dirs().await.unwrap();
        let db = Database::open(var_dir.join("cellar.db")).await.unwrap();
        let storage = FaultyStorage::new(Arc::new(DirStorage::new(layout.clone())));
        let runtime = FakeRuntime::new();
        let ctx = LifecycleContext::new(
            config,
            db,
            storage.clone(),
            runtime.clone(),
            Operations::new(4),
            IdmapSet::parse_lines(["b 0 100000 65536"]).unwrap(),
        );
        Self {
            ctx,
            runtime,
            storage,
            layout,
        }
    }

    /// Inserts a record and gives it a small rootfs.
    pub async fn seed_container(&self, name: &str, args: ContainerArgs) -> ContainerRecord {
        self.ctx.db.create_container(name, &args).await.unwrap();
        let rootfs = self.layout.rootfs_path(name);
        tokio::fs::create_dir_all(rootfs.join("etc")).await.unwrap();
        tokio::fs::write(rootfs.join("etc/hostname"), format!("{name}\n"))
            .await
            .unwrap();
        self.ctx.load_container(name).await.unwrap()
    }

    pub async fn seed_running(&self, name: &str, args: ContainerArgs) -> ContainerRecord {
        let record = self.seed_container(name, args).await;
        self.runtime.set_state(name, ContainerState::Running);
        record
    }
}

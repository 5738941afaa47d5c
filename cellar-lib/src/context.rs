use cellar_common::CellarError;
use cellar_lifecycle::db::DbError;
use cellar_lifecycle::storage::backend_for;
use cellar_lifecycle::{
    ContainerRuntime, Database, Layout, LifecycleContext, LxcRuntime, Operations,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigError, DaemonConfig};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] CellarError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the daemon's request handlers share.
#[derive(Clone)]
pub struct CellarContext {
    pub config: Arc<DaemonConfig>,
    pub lifecycle: LifecycleContext,
}

impl CellarContext {
    /// Opens the database, prepares the directory layout and picks the
    /// storage backend, then drives containers through LXC.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let runtime = Arc::new(LxcRuntime::new(config.lxc_config()));
        Self::with_runtime(config, runtime).await
    }

    pub async fn with_runtime(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, DaemonError> {
        let layout = Layout::new(&config.var_dir);
        layout.ensure_dirs().await?;

        let db = Database::open(config.database_path()).await?;
        let storage = backend_for(config.storage_driver, layout).await;
        info!(
            storage = storage.name(),
            database = %config.database_path().display(),
            "Initializing cellar context"
        );

        let lifecycle = LifecycleContext::new(
            config.lifecycle_config(),
            db,
            storage,
            runtime,
            Operations::new(config.max_concurrent_operations),
            config.idmap_set()?,
        );

        Ok(Self {
            config: Arc::new(config),
            lifecycle,
        })
    }

    /// Boot sequence: watch ephemeral containers that survived the daemon
    /// restart, then bring back the ones stopped by the last shutdown.
    /// Restarted ephemeral containers get their watcher from the start itself.
    pub async fn boot(&self) -> Result<(), DaemonError> {
        let watchers = self.lifecycle.watch_running_ephemerals().await?;
        info!(ephemeral = watchers.len(), "Watching running ephemeral containers");
        self.lifecycle.restart_on_boot().await?;
        Ok(())
    }

    /// Periodically forgets finished operations older than `retention` and
    /// drops idle container locks.
    pub fn spawn_maintenance(&self, every: Duration, retention: Duration) -> JoinHandle<()> {
        let lifecycle = self.lifecycle.clone();
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let pruned = lifecycle.operations.prune_finished(chrono::Utc::now() - retention);
                lifecycle.locks.prune();
                if pruned > 0 {
                    debug!(pruned, "Pruned finished operations");
                }
            }
        })
    }

    /// Stops taking new operations and shuts every running container down.
    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.lifecycle.operations.close();
        self.lifecycle.shutdown_all().await?;
        Ok(())
    }
}

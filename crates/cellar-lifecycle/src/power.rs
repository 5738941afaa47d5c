//! Daemon start/stop bookkeeping and ephemeral container collection.

use cellar_common::{CellarError, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::context::LifecycleContext;
use crate::runtime::ContainerState;

impl LifecycleContext {
    /// Starts every container that was running when the daemon last shut
    /// down. Flags are cleared before anything starts, so a crash mid-way
    /// never restarts a container twice. Every container is attempted; the
    /// first failure is returned.
    #[instrument(skip(self))]
    pub async fn restart_on_boot(&self) -> Result<usize> {
        let names = self.db.power_state_names().await?;
        self.db.clear_power_state().await?;

        let mut first_err = None;
        let mut started = 0;
        for name in &names {
            match self.start_container(name).await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(container = %name, error = %e, "Failed to restart container");
                    first_err.get_or_insert(e);
                }
            }
        }

        info!(started, total = names.len(), "Restored container power state");
        match first_err {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Flags every running container for restart and shuts them all down in
    /// parallel, returning once every shutdown task has finished.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) -> Result<()> {
        let names = self.db.regular_container_names().await?;
        let timeout = self.config.shutdown_timeout;

        let mut first_err: Option<CellarError> = None;
        let mut handles = Vec::new();
        for name in names {
            if !self.runtime.is_running(&name).await {
                continue;
            }
            if let Err(e) = self.db.set_power_state(&name, true).await {
                error!(container = %name, error = %e, "Failed to record power state");
                first_err.get_or_insert(e.into());
            }

            let runtime = self.runtime.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = runtime.shutdown(&name, timeout).await {
                    warn!(container = %name, error = %e, "Clean shutdown failed");
                }
                // Unconditional: a clean shutdown normally leaves nothing to stop.
                if let Err(e) = runtime.stop(&name).await {
                    debug!(container = %name, error = %e, "Hard stop after shutdown");
                }
            }));
        }

        info!(count = handles.len(), "Waiting for containers to shut down");
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Shutdown task panicked");
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deletes `name` once it stops for good. A stop followed by a start
    /// within the restart window (a reboot) keeps it alive until the next
    /// stop.
    pub fn watch_ephemeral(&self, name: &str) -> JoinHandle<()> {
        let ctx = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = ctx.ephemeral_lifecycle(&name).await {
                warn!(container = %name, error = %e, "Ephemeral watcher gave up");
            }
        })
    }

    async fn ephemeral_lifecycle(&self, name: &str) -> Result<()> {
        let window = self.config.ephemeral_restart_window;

        self.runtime
            .wait_for(name, ContainerState::Stopped, None)
            .await?;
        let rebooted = self
            .runtime
            .wait_for(name, ContainerState::Running, Some(window))
            .await?;
        debug!(container = %name, rebooted, "Ephemeral container stopped");
        self.runtime
            .wait_for(name, ContainerState::Stopped, None)
            .await?;

        let _guard = self.locks.lock(name).await;
        if self.db.container_id(name).await?.is_none() {
            debug!(container = %name, "Ephemeral container already gone");
            return Ok(());
        }
        self.remove_container_locked(name).await?;
        info!(container = %name, "Removed ephemeral container");
        Ok(())
    }

    /// Arms a watcher for each ephemeral container that is running now.
    pub async fn watch_running_ephemerals(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut watchers = Vec::new();
        for name in self.db.regular_container_names().await? {
            let record = match self.db.load_container(&name).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(container = %name, error = %e, "Failed to load container");
                    continue;
                }
            };
            if record.ephemeral && self.runtime.is_running(&name).await {
                watchers.push(self.watch_ephemeral(&name));
            }
        }
        Ok(watchers)
    }
}

use cellar_common::{validate_record_name, CellarError, ContainerRecord, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::idmap::IdmapSet;
use crate::layout::Layout;
use crate::locks::ContainerLocks;
use crate::namer::NamingFailurePolicy;
use crate::operations::Operations;
use crate::runtime::ContainerRuntime;
use crate::storage::StorageBackend;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Grace period for a clean shutdown before the hard stop.
    pub shutdown_timeout: Duration,
    /// How long a stopped ephemeral container may take to come back before
    /// it is considered gone.
    pub ephemeral_restart_window: Duration,
    pub naming_failure_policy: NamingFailurePolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            ephemeral_restart_window: Duration::from_secs(1),
            naming_failure_policy: NamingFailurePolicy::default(),
        }
    }
}

/// Long-lived handles every lifecycle operation works against.
/// Created once at daemon start and passed around by clone.
#[derive(Clone)]
pub struct LifecycleContext {
    pub config: Arc<LifecycleConfig>,
    pub db: Database,
    pub layout: Layout,
    pub storage: Arc<dyn StorageBackend>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub operations: Operations,
    pub locks: ContainerLocks,
    /// Shift table applied to unprivileged containers.
    pub idmap: Arc<IdmapSet>,
}

impl LifecycleContext {
    pub fn new(
        config: LifecycleConfig,
        db: Database,
        storage: Arc<dyn StorageBackend>,
        runtime: Arc<dyn ContainerRuntime>,
        operations: Operations,
        idmap: IdmapSet,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            layout: storage.layout().clone(),
            storage,
            runtime,
            operations,
            locks: ContainerLocks::new(),
            idmap: Arc::new(idmap),
        }
    }

    /// Loads a record or fails with `NotFound`. Names that could escape the
    /// storage directories are a `BadRequest`.
    pub async fn load_container(&self, name: &str) -> Result<ContainerRecord> {
        validate_record_name(name)?;
        self.db
            .load_container(name)
            .await?
            .ok_or_else(|| CellarError::NotFound(format!("container {name}")))
    }
}

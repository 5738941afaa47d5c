//! Snapshot create, list, get, rename and delete.
//!
//! A snapshot is a row named `<parent>/<leaf>` plus a filesystem copy of the
//! parent, and for stateful snapshots a checkpoint of the running parent in
//! its `state/` directory. Creation is all-or-nothing at the database layer:
//! if checkpointing or the filesystem snapshot fails, the row is deleted
//! again before the operation reports the error.

use cellar_common::{
    snapshot_full_name, split_snapshot_name, validate_snapshot_leaf, CellarError,
    ContainerRecord, Result, SNAPSHOT_DELIMITER,
};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use tracing::{info, instrument, warn};

use crate::context::LifecycleContext;
use crate::namer::next_snapshot_name;
use crate::operations::{Operation, Progress};
use crate::storage::path_exists;

pub const API_VERSION: &str = "1.0";

pub fn container_url(name: &str) -> String {
    format!("/{API_VERSION}/containers/{name}")
}

pub fn snapshot_url(parent: &str, leaf: &str) -> String {
    format!("/{API_VERSION}/containers/{parent}/snapshots/{leaf}")
}

/// Result metadata of a successful create or rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCreated {
    pub id: i64,
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub name: String,
    pub stateful: bool,
}

/// Listing shape depends on the requested recursion level.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotListing {
    References(Vec<String>),
    Full(Vec<SnapshotSummary>),
}

impl SnapshotListing {
    pub fn len(&self) -> usize {
        match self {
            SnapshotListing::References(urls) => urls.len(),
            SnapshotListing::Full(bodies) => bodies.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn leaf_of(full_name: &str) -> Result<(&str, &str)> {
    split_snapshot_name(full_name)
        .ok_or_else(|| CellarError::BadRequest(format!("{full_name:?} is not a snapshot name")))
}

impl LifecycleContext {
    /// Starts a snapshot of `parent`. A missing or empty `requested_name`
    /// picks the next free `snapN`.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        parent: &str,
        requested_name: Option<&str>,
        stateful: bool,
    ) -> Result<Operation> {
        let parent_record = self.load_container(parent).await?;
        if parent_record.is_snapshot() {
            return Err(CellarError::BadRequest(format!(
                "cannot snapshot snapshot {parent}"
            )));
        }
        let requested = requested_name.filter(|n| !n.is_empty()).map(str::to_string);
        if let Some(leaf) = &requested {
            validate_snapshot_leaf(leaf)?;
        }

        let ctx = self.clone();
        let parent = parent.to_string();
        let resources = vec![container_url(&parent)];
        Ok(self.operations.submit(
            format!("Snapshotting container {parent}"),
            resources,
            move |progress| async move {
                let _guard = ctx.locks.lock(&parent).await;
                ctx.snapshot_locked(&parent, requested, stateful, progress)
                    .await
            },
        ))
    }

    async fn snapshot_locked(
        &self,
        parent: &str,
        requested: Option<String>,
        stateful: bool,
        progress: Progress,
    ) -> Result<SnapshotCreated> {
        // Reload under the lock so the copy reflects the parent as of now.
        let source = self.load_container(parent).await?;
        let leaf = match requested {
            Some(leaf) => leaf,
            None => {
                next_snapshot_name(&self.db, parent, self.config.naming_failure_policy).await?
            }
        };
        let full_name = snapshot_full_name(parent, &leaf);

        progress.update("Persisting snapshot record");
        let args = source.snapshot_args();
        let id = self.db.create_container(&full_name, &args).await?;
        let record = ContainerRecord {
            id,
            name: full_name.clone(),
            ctype: args.ctype,
            config: args.config,
            profiles: args.profiles,
            devices: args.devices,
            ephemeral: args.ephemeral,
            architecture: args.architecture,
            power_state: false,
        };

        if let Err(err) = self
            .populate_snapshot(&source, &record, stateful, &progress)
            .await
        {
            warn!(snapshot = %full_name, error = %err, "Snapshot failed, rolling back");
            self.rollback_snapshot(&record).await;
            return Err(err);
        }

        info!(snapshot = %full_name, stateful, "Snapshot created");
        Ok(SnapshotCreated {
            id,
            name: leaf,
            full_name,
        })
    }

    async fn populate_snapshot(
        &self,
        source: &ContainerRecord,
        record: &ContainerRecord,
        stateful: bool,
        progress: &Progress,
    ) -> Result<()> {
        if stateful {
            if !self.runtime.is_running(&source.name).await {
                return Err(CellarError::InvalidState(format!(
                    "container {} is not running",
                    source.name
                )));
            }
            let state_dir = self.layout.state_dir(&record.name);
            tokio::fs::create_dir_all(&state_dir).await?;
            tokio::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o700))
                .await?;

            progress.update("Checkpointing container");
            self.runtime
                .checkpoint(&source.name, &state_dir, true)
                .await?;
        }

        progress.update("Snapshotting filesystem");
        self.storage.snapshot_create(record, source).await
    }

    /// Undo a half-made snapshot: the row always goes; partial filesystem
    /// state is removed on a best-effort basis.
    async fn rollback_snapshot(&self, record: &ContainerRecord) {
        if let Err(e) = self.storage.delete(record).await {
            warn!(snapshot = %record.name, error = %e, "Failed to clean up snapshot storage");
        }
        if let Err(e) = self.db.delete_container(record.id).await {
            warn!(snapshot = %record.name, error = %e, "Failed to remove snapshot record");
        }
    }

    /// Lists `parent`'s snapshots: URLs at recursion 0, bodies above.
    /// Snapshots whose record cannot be loaded are skipped.
    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, parent: &str, recursion: u32) -> Result<SnapshotListing> {
        self.load_container(parent).await?;

        let prefix = format!("{parent}{SNAPSHOT_DELIMITER}");
        let names = self.db.snapshot_names_with_prefix(&prefix).await?;

        let mut urls = Vec::new();
        let mut bodies = Vec::new();
        for full_name in names {
            match self.db.load_container(&full_name).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(snapshot = %full_name, "Snapshot vanished during listing");
                    continue;
                }
                Err(e) => {
                    warn!(snapshot = %full_name, error = %e, "Failed to load snapshot");
                    continue;
                }
            }
            let leaf = &full_name[prefix.len()..];
            if recursion == 0 {
                urls.push(snapshot_url(parent, leaf));
            } else {
                bodies.push(SnapshotSummary {
                    name: leaf.to_string(),
                    stateful: path_exists(&self.layout.state_dir(&full_name)).await,
                });
            }
        }

        Ok(if recursion == 0 {
            SnapshotListing::References(urls)
        } else {
            SnapshotListing::Full(bodies)
        })
    }

    pub async fn get_snapshot(&self, parent: &str, leaf: &str) -> Result<SnapshotSummary> {
        let full_name = snapshot_full_name(parent, leaf);
        let record = self.load_container(&full_name).await?;
        Ok(SnapshotSummary {
            name: leaf.to_string(),
            stateful: path_exists(&self.layout.state_dir(&record.name)).await,
        })
    }

    /// Renames `<parent>/<leaf>` to `<parent>/<new_leaf>`.
    #[instrument(skip(self))]
    pub async fn rename_snapshot(&self, full_name: &str, new_leaf: &str) -> Result<Operation> {
        let (parent, _) = leaf_of(full_name)?;
        validate_snapshot_leaf(new_leaf)?;
        self.load_container(full_name).await?;

        let ctx = self.clone();
        let old_name = full_name.to_string();
        let new_name = snapshot_full_name(parent, new_leaf);
        let new_leaf = new_leaf.to_string();
        Ok(self.operations.submit(
            format!("Renaming snapshot {old_name} to {new_name}"),
            vec![snapshot_url(parent, &new_leaf)],
            move |_| async move {
                let _guard = ctx.locks.lock(&old_name).await;
                let record = ctx.load_container(&old_name).await?;
                if ctx.db.container_id(&new_name).await?.is_some() {
                    return Err(CellarError::Conflict(format!("container {new_name}")));
                }

                ctx.storage.rename(&old_name, &new_name).await?;
                if let Err(e) = ctx.db.rename_container(&old_name, &new_name).await {
                    if let Err(undo) = ctx.storage.rename(&new_name, &old_name).await {
                        warn!(snapshot = %old_name, error = %undo, "Failed to move storage back");
                    }
                    return Err(e.into());
                }

                info!(from = %old_name, to = %new_name, "Snapshot renamed");
                Ok(SnapshotCreated {
                    id: record.id,
                    name: new_leaf,
                    full_name: new_name,
                })
            },
        ))
    }

    /// Deletes one snapshot: filesystem first, then its row.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, full_name: &str) -> Result<Operation> {
        let (parent, leaf) = leaf_of(full_name)?;
        self.load_container(full_name).await?;

        let ctx = self.clone();
        let name = full_name.to_string();
        Ok(self.operations.submit(
            format!("Deleting snapshot {name}"),
            vec![snapshot_url(parent, leaf)],
            move |_| async move {
                let _guard = ctx.locks.lock(&name).await;
                let record = ctx.load_container(&name).await?;
                ctx.storage.delete(&record).await?;
                ctx.db.delete_container(record.id).await?;
                info!(snapshot = %name, "Snapshot deleted");
                Ok(())
            },
        ))
    }
}

//! Container and snapshot lifecycle for the cellar daemon.
//!
//! Records live in SQLite ([`db`]), filesystems in a [`storage`] backend and
//! live containers behind a [`runtime`] handle. [`LifecycleContext`] bundles
//! them; the coordinator operations are methods on it, grouped by concern in
//! [`snapshot`], [`container`] and [`power`]. Mutations run as background
//! [`operations`].

// Re-export dependencies potentially needed by consumers
pub use cellar_common as common;

pub mod container;
pub mod context;
pub mod db;
pub mod export;
pub mod idmap;
pub mod layout;
pub mod locks;
pub mod namer;
pub mod operations;
pub mod power;
pub mod runtime;
pub mod snapshot;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use context::{LifecycleConfig, LifecycleContext};
pub use db::Database;
pub use export::TarExporter;
pub use idmap::{IdmapEntry, IdmapSet};
pub use layout::Layout;
pub use namer::NamingFailurePolicy;
pub use operations::{Operation, OperationState, OperationStatus, Operations};
pub use runtime::{ContainerRuntime, ContainerState, LxcConfig, LxcRuntime};
pub use snapshot::{SnapshotCreated, SnapshotListing, SnapshotSummary};
pub use storage::{BackingFs, StorageBackend, StorageDriver};

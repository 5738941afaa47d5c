// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separates a parent container name from a snapshot's leaf name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Config key that marks a container as privileged (no id shifting).
pub const PRIVILEGED_KEY: &str = "security.privileged";

#[derive(Error, Debug)]
pub enum CellarError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Runtime failure: {0}")]
    Runtime(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl CellarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CellarError::NotFound(_) => ErrorKind::NotFound,
            CellarError::InvalidState(_) => ErrorKind::InvalidState,
            CellarError::BadRequest(_) => ErrorKind::BadRequest,
            CellarError::Conflict(_) => ErrorKind::Conflict,
            CellarError::Storage(_) => ErrorKind::Storage,
            CellarError::Persistence(_) => ErrorKind::Persistence,
            CellarError::Runtime(_) => ErrorKind::Runtime,
            CellarError::Io(_) => ErrorKind::Io,
            CellarError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Cloneable discriminant of [`CellarError`], kept by finished operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    BadRequest,
    Conflict,
    Storage,
    Persistence,
    Runtime,
    Io,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

// Define the primary Result type for cellar operations
pub type Result<T> = std::result::Result<T, CellarError>;

/// Persisted discriminant of a container row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Regular = 0,
    Snapshot = 1,
}

impl ContainerType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ContainerType::Regular),
            1 => Some(ContainerType::Snapshot),
            _ => None,
        }
    }
}

/// Device name -> device properties (`type`, `path`, ...).
pub type Devices = BTreeMap<String, BTreeMap<String, String>>;

/// Everything needed to insert a container row. `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerArgs {
    pub ctype: ContainerType,
    pub config: BTreeMap<String, String>,
    pub profiles: Vec<String>,
    pub devices: Devices,
    pub ephemeral: bool,
    pub architecture: i64,
}

impl Default for ContainerArgs {
    fn default() -> Self {
        Self {
            ctype: ContainerType::Regular,
            config: BTreeMap::new(),
            profiles: vec!["default".to_string()],
            devices: Devices::new(),
            ephemeral: false,
            architecture: 0,
        }
    }
}

/// A persisted container or snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: i64,
    pub name: String,
    pub ctype: ContainerType,
    pub config: BTreeMap<String, String>,
    pub profiles: Vec<String>,
    pub devices: Devices,
    pub ephemeral: bool,
    pub architecture: i64,
    pub power_state: bool,
}

impl ContainerRecord {
    pub fn is_snapshot(&self) -> bool {
        self.ctype == ContainerType::Snapshot
    }

    pub fn is_privileged(&self) -> bool {
        self.config
            .get(PRIVILEGED_KEY)
            .map(|v| matches!(v.as_str(), "true" | "1"))
            .unwrap_or(false)
    }

    /// Copies the parts a snapshot inherits from its parent.
    pub fn snapshot_args(&self) -> ContainerArgs {
        ContainerArgs {
            ctype: ContainerType::Snapshot,
            config: self.config.clone(),
            profiles: self.profiles.clone(),
            devices: self.devices.clone(),
            ephemeral: false,
            architecture: self.architecture,
        }
    }
}

/// `<parent><delimiter><leaf>`
pub fn snapshot_full_name(parent: &str, leaf: &str) -> String {
    format!("{parent}{SNAPSHOT_DELIMITER}{leaf}")
}

/// Splits a snapshot name at the first delimiter. Names are flat strings:
/// everything after the first delimiter is the leaf.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SNAPSHOT_DELIMITER)
}

pub fn is_snapshot_name(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

/// Name of the container that owns `name` (itself for regular containers).
pub fn base_container_name(name: &str) -> &str {
    split_snapshot_name(name).map(|(parent, _)| parent).unwrap_or(name)
}

pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CellarError::BadRequest("container name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(CellarError::BadRequest(format!(
            "invalid container name {name:?}"
        )));
    }
    if is_snapshot_name(name) {
        return Err(CellarError::BadRequest(format!(
            "container name {name:?} may not contain {SNAPSHOT_DELIMITER:?}"
        )));
    }
    Ok(())
}

/// Checks a regular container name or a full `<parent>/<leaf>` snapshot name.
pub fn validate_record_name(name: &str) -> Result<()> {
    match split_snapshot_name(name) {
        Some((parent, leaf)) => {
            validate_container_name(parent)?;
            validate_snapshot_leaf(leaf)
        }
        None => validate_container_name(name),
    }
}

pub fn validate_snapshot_leaf(leaf: &str) -> Result<()> {
    if leaf.is_empty() {
        return Err(CellarError::BadRequest("snapshot name is empty".to_string()));
    }
    if leaf == "." || leaf == ".." {
        return Err(CellarError::BadRequest(format!(
            "invalid snapshot name {leaf:?}"
        )));
    }
    if leaf.contains(SNAPSHOT_DELIMITER) {
        return Err(CellarError::BadRequest(format!(
            "snapshot name {leaf:?} may not contain {SNAPSHOT_DELIMITER:?}"
        )));
    }
    Ok(())
}

//! Live container control. The runtime itself is external; this crate only
//! consumes the capability.

mod lxc;

pub use lxc::{LxcConfig, LxcRuntime};

use async_trait::async_trait;
use cellar_common::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Frozen,
}

impl ContainerState {
    pub fn as_lxc_str(self) -> &'static str {
        match self {
            ContainerState::Stopped => "STOPPED",
            ContainerState::Starting => "STARTING",
            ContainerState::Running => "RUNNING",
            ContainerState::Stopping => "STOPPING",
            ContainerState::Frozen => "FROZEN",
        }
    }

    pub fn from_lxc_str(s: &str) -> Option<Self> {
        match s.trim() {
            "STOPPED" => Some(ContainerState::Stopped),
            "STARTING" => Some(ContainerState::Starting),
            "RUNNING" | "THAWED" => Some(ContainerState::Running),
            "STOPPING" | "ABORTING" => Some(ContainerState::Stopping),
            "FROZEN" | "FREEZING" => Some(ContainerState::Frozen),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_lxc_str())
    }
}

/// Start/stop/checkpoint primitives for a named container.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn is_running(&self, name: &str) -> bool;

    async fn start(&self, name: &str) -> Result<()>;

    /// Hard stop.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Ask the init process to shut down, waiting up to `timeout`.
    async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Dump the container's live state into `directory`.
    async fn checkpoint(&self, name: &str, directory: &Path, stop_after: bool) -> Result<()>;

    /// Wait until the container reaches `state`. `None` waits forever.
    /// Returns `false` if the timeout expired first; any other failure is
    /// an error.
    async fn wait_for(
        &self,
        name: &str,
        state: ContainerState,
        timeout: Option<Duration>,
    ) -> Result<bool>;
}

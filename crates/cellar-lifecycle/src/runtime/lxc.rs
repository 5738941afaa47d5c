use async_trait::async_trait;
use cellar_common::{CellarError, Result};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

use super::{ContainerRuntime, ContainerState};

#[derive(Debug, Clone)]
pub struct LxcConfig {
    /// Directory holding one LXC config directory per container.
    pub lxc_path: PathBuf,
    /// Directory holding the `lxc-*` tools; `None` resolves through `PATH`.
    pub tools_dir: Option<PathBuf>,
    /// Upper bound for any single tool invocation that is not a wait.
    pub command_timeout: Duration,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            lxc_path: PathBuf::from("/var/lib/cellar/containers"),
            tools_dir: None,
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Drives LXC through its command line tools.
pub struct LxcRuntime {
    config: LxcConfig,
}

impl LxcRuntime {
    pub fn new(config: LxcConfig) -> Self {
        info!(lxc_path = %config.lxc_path.display(), "LXC runtime initialized");
        Self { config }
    }

    fn command(&self, tool: &str, name: &str) -> AsyncCommand {
        let binary = match &self.config.tools_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        };
        let mut cmd = AsyncCommand::new(binary);
        cmd.arg("-P").arg(&self.config.lxc_path).arg("-n").arg(name);
        cmd
    }

    async fn output(&self, mut cmd: AsyncCommand, limit: Option<Duration>) -> Result<Output> {
        let desc = format!("{cmd:?}");
        debug!("LXC command: {}", desc);
        let output = match limit {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| CellarError::Runtime(format!("{desc} timed out after {limit:?}")))?,
            None => cmd.output().await,
        };
        output.map_err(|e| CellarError::Runtime(format!("failed to spawn {desc}: {e}")))
    }

    async fn run(&self, cmd: AsyncCommand, what: &str, name: &str) -> Result<()> {
        let output = self.output(cmd, Some(self.config.command_timeout)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(container = %name, "{} failed: {}", what, stderr.trim());
            return Err(CellarError::Runtime(format!(
                "{what} {name} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let mut cmd = self.command("lxc-info", name);
        cmd.arg("-s").arg("-H");
        let output = self.output(cmd, Some(self.config.command_timeout)).await?;
        if !output.status.success() {
            return Err(CellarError::NotFound(format!("container {name}")));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        ContainerState::from_lxc_str(&stdout)
            .ok_or_else(|| CellarError::Runtime(format!("unknown state {:?}", stdout.trim())))
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn is_running(&self, name: &str) -> bool {
        match self.state(name).await {
            Ok(state) => state == ContainerState::Running,
            Err(e) => {
                debug!(container = %name, error = %e, "State lookup failed");
                false
            }
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut cmd = self.command("lxc-start", name);
        cmd.arg("-d");
        self.run(cmd, "lxc-start", name).await?;
        info!(container = %name, "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut cmd = self.command("lxc-stop", name);
        cmd.arg("-k");
        self.run(cmd, "lxc-stop", name).await
    }

    async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut cmd = self.command("lxc-stop", name);
        cmd.arg("-t").arg(timeout.as_secs().to_string());
        // lxc-stop enforces its own timeout; leave a margin before giving up on it.
        let output = self
            .output(cmd, Some(timeout + Duration::from_secs(5)))
            .await?;
        if !output.status.success() {
            warn!(container = %name, "Clean shutdown did not complete");
            return Err(CellarError::Runtime(format!(
                "shutdown of {name} did not complete within {timeout:?}"
            )));
        }
        Ok(())
    }

    async fn checkpoint(&self, name: &str, directory: &Path, stop_after: bool) -> Result<()> {
        let mut cmd = self.command("lxc-checkpoint", name);
        cmd.arg("-D").arg(directory).arg("-v");
        if stop_after {
            cmd.arg("-s");
        }
        self.run(cmd, "lxc-checkpoint", name).await?;
        info!(container = %name, dir = %directory.display(), "Checkpoint written");
        Ok(())
    }

    async fn wait_for(
        &self,
        name: &str,
        state: ContainerState,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let mut cmd = self.command("lxc-wait", name);
        cmd.arg("-s").arg(state.as_lxc_str());
        if let Some(timeout) = timeout {
            // lxc-wait only takes whole seconds.
            cmd.arg("-t").arg(timeout.as_secs().max(1).to_string());
        }
        let output = self.output(cmd, None).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        match timeout {
            Some(timeout) => {
                debug!(container = %name, %state, ?timeout, "lxc-wait gave up: {}", stderr.trim());
                Ok(false)
            }
            // Without a deadline a failing lxc-wait can only be an error.
            None => Err(CellarError::Runtime(format!(
                "lxc-wait for {name} to reach {state} failed: {}",
                stderr.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing() {
        assert_eq!(
            ContainerState::from_lxc_str("RUNNING\n"),
            Some(ContainerState::Running)
        );
        assert_eq!(
            ContainerState::from_lxc_str("THAWED"),
            Some(ContainerState::Running)
        );
        assert_eq!(ContainerState::from_lxc_str("bogus"), None);
        assert_eq!(ContainerState::Stopped.to_string(), "STOPPED");
    }

    #[tokio::test]
    async fn test_missing_tools_are_runtime_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LxcRuntime::new(LxcConfig {
            lxc_path: tmp.path().to_path_buf(),
            tools_dir: Some(tmp.path().join("no-such-bin")),
            command_timeout: Duration::from_secs(5),
        });

        assert!(!runtime.is_running("web").await);
        assert!(matches!(
            runtime.start("web").await,
            Err(CellarError::Runtime(_))
        ));
    }

    /// Installs `tool` as a link to `true` or `false`.
    fn fake_tool(dir: &Path, tool: &str, succeed: bool) {
        let target = if succeed { "true" } else { "false" };
        let binary = ["/usr/bin", "/bin"]
            .iter()
            .map(|d| Path::new(d).join(target))
            .find(|p| p.exists())
            .unwrap();
        std::os::unix::fs::symlink(binary, dir.join(tool)).unwrap();
    }

    #[tokio::test]
    async fn test_failed_wait_without_deadline_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fake_tool(tmp.path(), "lxc-wait", false);
        let runtime = LxcRuntime::new(LxcConfig {
            lxc_path: tmp.path().to_path_buf(),
            tools_dir: Some(tmp.path().to_path_buf()),
            command_timeout: Duration::from_secs(5),
        });

        let err = runtime
            .wait_for("web", ContainerState::Stopped, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CellarError::Runtime(_)));

        let reached = runtime
            .wait_for("web", ContainerState::Running, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!reached);
    }

    #[tokio::test]
    async fn test_successful_wait_reports_reached() {
        let tmp = tempfile::tempdir().unwrap();
        fake_tool(tmp.path(), "lxc-wait", true);
        let runtime = LxcRuntime::new(LxcConfig {
            lxc_path: tmp.path().to_path_buf(),
            tools_dir: Some(tmp.path().to_path_buf()),
            command_timeout: Duration::from_secs(5),
        });

        assert!(runtime
            .wait_for("web", ContainerState::Stopped, None)
            .await
            .unwrap());
    }
}

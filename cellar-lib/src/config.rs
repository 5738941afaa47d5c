use cellar_lifecycle::{IdmapSet, LifecycleConfig, LxcConfig, NamingFailurePolicy, StorageDriver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "CELLAR_CONFIG";
const ENV_PREFIX: &str = "CELLAR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },
    #[error("invalid idmap: {0}")]
    Idmap(String),
}

/// Daemon settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub var_dir: PathBuf,
    /// Defaults to `<var_dir>/cellar.db`.
    pub database_path: Option<PathBuf>,
    /// Defaults to `<var_dir>/containers`.
    pub lxc_path: Option<PathBuf>,
    pub api_host: String,
    pub api_port: u16,
    pub storage_driver: StorageDriver,
    pub shutdown_timeout_secs: u64,
    pub ephemeral_restart_window_ms: u64,
    pub naming_failure_policy: NamingFailurePolicy,
    pub max_concurrent_operations: usize,
    /// `u|g|b <nsid> <hostid> <range>` lines; `None` reads `/etc/subuid`.
    pub idmap: Option<Vec<String>>,
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            var_dir: PathBuf::from("/var/lib/cellar"),
            database_path: None,
            lxc_path: None,
            api_host: "0.0.0.0".to_string(),
            api_port: 8443,
            storage_driver: StorageDriver::Auto,
            shutdown_timeout_secs: 30,
            ephemeral_restart_window_ms: 1000,
            naming_failure_policy: NamingFailurePolicy::Fail,
            max_concurrent_operations: 64,
            idmap: None,
            log_filter: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Defaults, then the YAML file named by `CELLAR_CONFIG`, then `CELLAR_*`
    /// variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays `CELLAR_*` values looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("VAR_DIR") {
            self.var_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LXC_PATH") {
            self.lxc_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("API_HOST") {
            self.api_host = v;
        }
        if let Some(v) = get("API_PORT") {
            self.api_port = parse_env("API_PORT", v)?;
        }
        if let Some(v) = get("STORAGE_DRIVER") {
            self.storage_driver = match v.as_str() {
                "auto" => StorageDriver::Auto,
                "dir" => StorageDriver::Dir,
                "btrfs" => StorageDriver::Btrfs,
                _ => return Err(invalid_env("STORAGE_DRIVER", v)),
            };
        }
        if let Some(v) = get("SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout_secs = parse_env("SHUTDOWN_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("EPHEMERAL_RESTART_WINDOW_MS") {
            self.ephemeral_restart_window_ms = parse_env("EPHEMERAL_RESTART_WINDOW_MS", v)?;
        }
        if let Some(v) = get("NAMING_FAILURE_POLICY") {
            self.naming_failure_policy = match v.as_str() {
                "fail" => NamingFailurePolicy::Fail,
                "fallback-to-zero" => NamingFailurePolicy::FallbackToZero,
                _ => return Err(invalid_env("NAMING_FAILURE_POLICY", v)),
            };
        }
        if let Some(v) = get("MAX_CONCURRENT_OPERATIONS") {
            self.max_concurrent_operations = parse_env("MAX_CONCURRENT_OPERATIONS", v)?;
        }
        if let Some(v) = get("IDMAP") {
            self.idmap = Some(v.split(',').map(|l| l.trim().to_string()).collect());
        }
        if let Some(v) = get("LOG") {
            self.log_filter = v;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.var_dir.join("cellar.db"))
    }

    pub fn lxc_config(&self) -> LxcConfig {
        LxcConfig {
            lxc_path: self
                .lxc_path
                .clone()
                .unwrap_or_else(|| self.var_dir.join("containers")),
            ..LxcConfig::default()
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ephemeral_restart_window: Duration::from_millis(self.ephemeral_restart_window_ms),
            naming_failure_policy: self.naming_failure_policy,
        }
    }

    pub fn idmap_set(&self) -> Result<IdmapSet, ConfigError> {
        match &self.idmap {
            Some(lines) => IdmapSet::parse_lines(lines).map_err(|e| ConfigError::Idmap(e.to_string())),
            None => Ok(IdmapSet::default_for_user("root")),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn invalid_env(var: &str, value: String) -> ConfigError {
    ConfigError::InvalidEnv {
        var: format!("{ENV_PREFIX}{var}"),
        value,
    }
}

fn parse_env<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid_env(var, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_derive_paths() {
        let config = DaemonConfig::default();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/cellar/cellar.db"));
        assert_eq!(
            config.lxc_config().lxc_path,
            PathBuf::from("/var/lib/cellar/containers")
        );
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        assert_eq!(
            config.lifecycle_config().ephemeral_restart_window,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_yaml_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cellar.yaml");
        std::fs::write(
            &path,
            "var_dir: /srv/cellar\nstorage_driver: btrfs\nnaming_failure_policy: fallback-to-zero\nidmap:\n  - b 0 200000 65536\n",
        )
        .unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.var_dir, PathBuf::from("/srv/cellar"));
        assert_eq!(config.storage_driver, StorageDriver::Btrfs);
        assert_eq!(config.naming_failure_policy, NamingFailurePolicy::FallbackToZero);
        assert_eq!(config.api_port, 8443);
        assert_eq!(config.idmap_set().unwrap().entries[0].host_id, 200_000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CELLAR_VAR_DIR", "/tmp/cellar"),
            ("CELLAR_API_PORT", "9000"),
            ("CELLAR_STORAGE_DRIVER", "dir"),
            ("CELLAR_IDMAP", "u 0 100000 65536, g 0 100000 65536"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.var_dir, PathBuf::from("/tmp/cellar"));
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.storage_driver, StorageDriver::Dir);
        assert_eq!(config.idmap_set().unwrap().entries.len(), 2);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_env(|k| (k == "CELLAR_API_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "CELLAR_API_PORT"));
    }
}

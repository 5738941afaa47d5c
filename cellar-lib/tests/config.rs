use cellar_lib::config::CONFIG_ENV;
use cellar_lib::{ConfigError, DaemonConfig};
use serial_test::serial;
use std::path::PathBuf;

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("CELLAR_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_load_file_then_env() {
    clear_env();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cellar.yaml");
    std::fs::write(&path, "var_dir: /srv/cellar\napi_port: 7000\n").unwrap();

    std::env::set_var(CONFIG_ENV, &path);
    std::env::set_var("CELLAR_API_PORT", "7443");
    let config = DaemonConfig::load().unwrap();
    clear_env();

    assert_eq!(config.var_dir, PathBuf::from("/srv/cellar"));
    assert_eq!(config.api_port, 7443);
    assert_eq!(config.database_path(), PathBuf::from("/srv/cellar/cellar.db"));
}

#[test]
#[serial]
fn test_load_without_file_uses_defaults() {
    clear_env();
    let config = DaemonConfig::load().unwrap();
    assert_eq!(config, DaemonConfig::default());
}

#[test]
#[serial]
fn test_missing_file_is_an_error() {
    clear_env();
    std::env::set_var(CONFIG_ENV, "/nonexistent/cellar.yaml");
    let err = DaemonConfig::load().unwrap_err();
    clear_env();
    assert!(matches!(err, ConfigError::Read { .. }));
}

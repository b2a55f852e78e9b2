use std::fs;

use serde::Serialize;
use winmount_client::config::{AppConfig, DEFAULT_DAEMON_PORT};

#[derive(Serialize)]
struct CliFlags {
    #[serde(skip_serializing_if = "Option::is_none")]
    daemon_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
}

#[test]
fn test_config_file_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.toml");
    fs::write(
        &path,
        r#"
daemon_host = "192.168.1.20"
json_logs = true
"#,
    )
    .unwrap();

    let config = AppConfig::new(Some(path.as_path()), None::<&CliFlags>).expect("load config");
    assert_eq!(config.daemon_host, "192.168.1.20");
    assert_eq!(config.daemon_port, DEFAULT_DAEMON_PORT);
    assert!(config.json_logs);
    assert_eq!(config.ws_url(), "ws://192.168.1.20:19423/ws");
}

#[test]
fn test_flags_beat_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.toml");
    fs::write(&path, "daemon_host = \"10.1.1.1\"\nverbose = false\n").unwrap();

    let flags = CliFlags {
        daemon_host: Some("localhost".to_string()),
        verbose: Some(true),
    };
    let config = AppConfig::new(Some(path.as_path()), Some(&flags)).expect("load config");
    assert_eq!(config.daemon_host, "localhost");
    assert!(config.verbose);
    assert_eq!(config.shutdown_url(), "http://localhost:19423/api/shutdown");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::new(Some(dir.path().join("absent.toml").as_path()), None::<&CliFlags>)
        .expect("load config");
    assert_eq!(config.daemon_host, AppConfig::default().daemon_host);
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.toml");
    fs::write(&path, "daemon_port = \"not a port\"").unwrap();
    assert!(AppConfig::new(Some(path.as_path()), None::<&CliFlags>).is_err());
}

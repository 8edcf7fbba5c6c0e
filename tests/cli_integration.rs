//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing and configuration loading.

use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use shell_relay::cli::{parse_args_from, Args};
use shell_relay::config::{Config, MachineKind, TransportConfig};

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("shell-relay")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.config.is_none());
    assert!(result.machine.is_none());
    assert!(result.timeout_secs.is_none());
    assert!(!result.check);
    assert!(result.command_line().is_none());
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-c",
        "/etc/shell-relay.json",
        "-m",
        "db",
        "-t",
        "15",
        "-l",
        "debug",
        "--",
        "systemctl",
        "status",
        "-l",
    ]))
    .unwrap();

    assert_eq!(
        result.config.as_ref().unwrap().to_str().unwrap(),
        "/etc/shell-relay.json"
    );
    assert_eq!(result.machine.as_deref(), Some("db"));
    assert_eq!(result.timeout_secs, Some(15));
    assert_eq!(result.log_level.as_deref(), Some("debug"));
    assert_eq!(
        result.command_line().as_deref(),
        Some("systemctl status -l")
    );
}

#[test]
fn test_cli_invalid_timeout() {
    assert!(parse_args_from(args(&["-t", "not-a-number"])).is_err());
    assert!(parse_args_from(args(&["-t", "0"])).is_err());
}

#[test]
fn test_cli_check_with_command_rejected() {
    let err = parse_args_from(args(&["--check", "uptime"])).unwrap_err();
    assert!(err.to_string().contains("--check"));
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let file = config_file(
        r#"{
        "workspace": "/srv/agent",
        "shell_timeout_secs": 30,
        "local": {
            "allowed_roots": ["/srv/agent", "/tmp"],
            "blocked_patterns": ["*/.git/*"]
        },
        "machines": [
            {
                "name": "db",
                "type": "ssh",
                "is_default": true,
                "ssh": {
                    "host": "10.0.0.5",
                    "username": "ops",
                    "private_key_path": "~/.ssh/id_ed25519"
                }
            },
            {
                "name": "win",
                "type": "winrm",
                "winrm": {
                    "host": "10.0.0.6",
                    "username": "Administrator",
                    "password": "secret",
                    "ssl": false,
                    "port": 5985
                }
            }
        ],
        "logging": {
            "level": "debug"
        }
    }"#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.workspace.to_str().unwrap(), "/srv/agent");
    assert_eq!(config.shell_timeout(), Duration::from_secs(30));
    assert_eq!(config.local.allowed_roots, vec!["/srv/agent", "/tmp"]);
    assert_eq!(config.machines.len(), 2);
    assert_eq!(config.default_machine_name(), "db");
    assert_eq!(config.machine_names(), vec!["local", "db", "win"]);
    assert_eq!(config.logging.level, "debug");

    match &config.machine("db").unwrap().transport {
        TransportConfig::Ssh { ssh } => {
            assert_eq!(ssh.port, 22);
            assert_eq!(ssh.allowed_roots, vec!["/home", "/tmp"]);
            assert!(ssh.password.is_none());
        }
        other => panic!("expected ssh transport, got {:?}", other),
    }

    let win = config.machine("win").unwrap();
    assert_eq!(win.kind(), MachineKind::Winrm);
    match &win.transport {
        TransportConfig::Winrm { winrm } => {
            assert_eq!(winrm.endpoint(), "http://10.0.0.6:5985/wsman");
            assert!(!winrm.cert_validation);
        }
        other => panic!("expected winrm transport, got {:?}", other),
    }
}

#[test]
fn test_config_priority_cli_over_file() {
    let file = config_file(r#"{"shell_timeout_secs": 120, "logging": {"level": "warn"}}"#);

    let args = Args {
        config: Some(file.path().to_path_buf()),
        timeout_secs: Some(5),
        log_level: Some("trace".to_string()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();

    assert_eq!(config.shell_timeout_secs, 5);
    assert_eq!(config.log_filter(), "trace");
}

#[test]
fn test_config_load_rejects_duplicate_names() {
    let file = config_file(
        r#"{"machines": [
            {"name": "box", "type": "winrm", "winrm": {"host": "a", "username": "u", "password": "p"}},
            {"name": "box", "type": "winrm", "winrm": {"host": "b", "username": "u", "password": "p"}}
        ]}"#,
    );

    let args = Args {
        config: Some(file.path().to_path_buf()),
        ..Args::default()
    };

    let err = Config::load(&args).unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn test_config_missing_file() {
    let args = Args {
        config: Some("/nonexistent/shell-relay.json".into()),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

#[test]
fn test_config_machine_without_type_rejected() {
    let file = config_file(r#"{"machines": [{"name": "x"}]}"#);
    assert!(Config::from_file(file.path()).is_err());
}

// ============================================================================
// Configuration Serialization Tests
// ============================================================================

#[test]
fn test_config_partial_deserialization() {
    let json = r#"{"shell_timeout_secs": 90}"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.shell_timeout_secs, 90);
    assert_eq!(config.workspace.to_str().unwrap(), "./workspace");
    assert!(config.machines.is_empty());
    assert_eq!(config.default_machine_name(), "local");
}

#[test]
fn test_config_serialization_redacts_nothing_but_debug_does() {
    let file = config_file(
        r#"{"machines": [
            {"name": "win", "type": "winrm", "winrm": {"host": "h", "username": "u", "password": "hunter2"}}
        ]}"#,
    );
    let config = Config::from_file(file.path()).unwrap();

    let debug = format!("{:?}", config);
    assert!(!debug.contains("hunter2"));

    let json = serde_json::to_string(&config).unwrap();
    let loaded: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(loaded.machines, config.machines);
}

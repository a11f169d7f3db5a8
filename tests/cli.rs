//! Binary-level checks that never reach the network.
use std::fs;
use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_onwatch-populate");

fn write_config(dir: &std::path::Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("config.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn steps_lists_every_stage_in_order() {
    let output = Command::new(BIN).arg("steps").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let slugs: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    assert_eq!(
        slugs,
        [
            "init-api",
            "set-kv-params",
            "configure-system",
            "configure-groups",
            "configure-accounts",
            "populate-watchlist",
            "configure-devices",
            "configure-inquiries",
            "upload-mass-import",
            "configure-rancher",
            "upload-files",
        ]
    );
}

#[test]
fn validate_accepts_a_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "onwatch:\n  ip_address: 10.1.1.1\n  username: admin\n  password: pw\n  version: \"2.8\"\n",
    );
    let output = Command::new(BIN)
        .args(["--quiet", "run", "--validate", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("onwatch_data_export_"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn invalid_config_exits_non_zero_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "onwatch:\n  ip_address: 10.1.1.300\n  username: admin\n  password: pw\n  version: \"3.1\"\n",
    );
    let output = Command::new(BIN)
        .args(["run", "--dry-run", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let log = String::from_utf8_lossy(&output.stdout);
    assert!(log.contains("onwatch.version"), "{log}");
}

#[test]
fn set_ip_rewrites_connection_addresses_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "onwatch:\n  ip_address: 10.1.1.1\n  username: admin\ndevices:\n  - name: Lobby\n    video_url: rtsp://10.1.1.1/lobby\n",
    );
    let output = Command::new(BIN)
        .args(["set-ip", "10.2.2.2", "--no-backup", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = fs::read_to_string(&config).unwrap();
    assert!(text.contains("ip_address: 10.2.2.2"));
    assert!(text.contains("rtsp://10.1.1.1/lobby"));
}

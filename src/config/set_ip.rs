//! Point a config file at a new appliance address without touching camera URLs.
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

const IPV4: &str = r"\b(?:\d{1,3}\.){3}\d{1,3}\b";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetIpReport {
    pub replacements: usize,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    OnWatch,
    Ssh,
    Rancher,
    Other,
}

/// Rewrite connection addresses line by line so comments and layout survive.
///
/// Only `ip_address` and `base_url` lines inside the `onwatch`, `ssh` and
/// `rancher` sections are touched.
pub fn rewrite_connection_ips(text: &str, new_ip: &str) -> Result<(String, usize)> {
    let header = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*):\s*(?:#.*)?$")?;
    let ip_line = Regex::new(&format!(r#"^(\s+ip_address:\s*["']?){IPV4}"#))?;
    let url_line = Regex::new(&format!(r"^(\s+base_url:.*https?://){IPV4}"))?;

    let mut section = Section::Other;
    let mut replacements = 0;
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        if let Some(caps) = header.captures(line.trim_end()) {
            section = match &caps[1] {
                "onwatch" => Section::OnWatch,
                "ssh" => Section::Ssh,
                "rancher" => Section::Rancher,
                _ => Section::Other,
            };
            out.push_str(line);
            continue;
        }
        if section == Section::Other {
            out.push_str(line);
            continue;
        }
        let replacement = format!("${{1}}{new_ip}");
        let rewritten = if ip_line.is_match(line) {
            ip_line.replace(line, replacement.as_str()).into_owned()
        } else if url_line.is_match(line) {
            url_line.replace(line, replacement.as_str()).into_owned()
        } else {
            out.push_str(line);
            continue;
        };
        if rewritten != line {
            tracing::debug!(before = line.trim(), after = rewritten.trim(), "rewrote connection address");
            replacements += 1;
        }
        out.push_str(&rewritten);
    }
    Ok((out, replacements))
}

/// Update a config file in place, keeping a timestamped backup unless disabled.
pub fn update_ip_address(path: &Path, new_ip: &str, backup: bool) -> Result<SetIpReport> {
    if new_ip.parse::<Ipv4Addr>().is_err() {
        bail!("invalid IPv4 address {new_ip:?}");
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let (updated, replacements) = rewrite_connection_ips(&text, new_ip)?;
    if replacements == 0 {
        bail!("no connection IP addresses to update in {}", path.display());
    }

    let backup_path = if backup {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = PathBuf::from(format!("{}.backup.{stamp}", path.display()));
        fs::copy(path, &backup_path)
            .with_context(|| format!("write backup {}", backup_path.display()))?;
        tracing::info!(backup = %backup_path.display(), "created config backup");
        Some(backup_path)
    } else {
        None
    };

    fs::write(path, updated).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(replacements, new_ip, "updated connection addresses");
    Ok(SetIpReport {
        replacements,
        backup: backup_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"# appliance
onwatch:
  ip_address: "10.1.1.1"   # lab box
  base_url: "https://10.1.1.1"
  username: admin
ssh:
  ip_address: "10.1.1.1"
rancher:
  ip_address: 10.1.1.1
  base_url: "https://10.1.1.1:9443"
devices:
  - name: Door
    video_url: "rtsp://10.9.9.9/stream"
    ip_address: "10.9.9.9"
"#;

    #[test]
    fn rewrites_only_connection_lines() {
        let (text, count) = rewrite_connection_ips(CONFIG, "192.168.5.20").unwrap();
        assert_eq!(count, 5);
        assert!(text.contains("  ip_address: \"192.168.5.20\"   # lab box\n"));
        assert!(text.contains("base_url: \"https://192.168.5.20:9443\""));
        assert!(text.contains("  ip_address: 192.168.5.20\n"));
        assert!(text.contains("rtsp://10.9.9.9/stream"));
        assert!(text.contains("    ip_address: \"10.9.9.9\""));
        assert!(text.starts_with("# appliance\n"));
    }

    #[test]
    fn update_writes_backup_and_rejects_bad_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, CONFIG).unwrap();

        assert!(update_ip_address(&path, "10.1.1", true).is_err());

        let report = update_ip_address(&path, "172.16.0.9", true).unwrap();
        assert_eq!(report.replacements, 5);
        let backup = report.backup.unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), CONFIG);
        assert!(fs::read_to_string(&path).unwrap().contains("172.16.0.9"));

        let err = update_ip_address(&path, "172.16.0.9", false).unwrap_err();
        assert!(err.to_string().contains("no connection IP"));
    }
}

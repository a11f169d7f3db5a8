//! Offline config checks, run before any network call.
use super::env::has_placeholder;
use super::{LoadedConfig, Priority};
use crate::api::version::{PlatformVersion, SUPPORTED_VERSIONS};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|issue| issue.severity == Severity::Error)
}

#[derive(Default)]
struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn push(&mut self, severity: Severity, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
            severity,
        });
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Error, path, message);
    }

    fn warning(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Warning, path, message);
    }

    fn required(&mut self, path: &str, value: &str) {
        if value.trim().is_empty() {
            self.error(path, "required field is missing");
        }
    }

    fn ipv4(&mut self, path: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() || has_placeholder(value) {
            return;
        }
        if value.parse::<Ipv4Addr>().is_err() {
            self.error(path, format!("invalid IPv4 address {value:?}"));
        }
    }

    fn file(&mut self, loaded: &LoadedConfig, path: &str, file: &Path, severity: Severity) {
        if file.as_os_str().is_empty() {
            self.push(severity, path, "file path is empty");
            return;
        }
        let resolved = loaded.resolve(file);
        if !resolved.is_file() {
            self.push(
                severity,
                path,
                format!("file not found: {}", resolved.display()),
            );
        }
    }
}

/// Check required fields, address formats, ports and referenced files.
pub fn validate(loaded: &LoadedConfig) -> Vec<ValidationIssue> {
    let config = &loaded.config;
    let mut issues = Issues::default();

    let onwatch = &config.onwatch;
    issues.required("onwatch.ip_address", &onwatch.ip_address);
    issues.required("onwatch.username", &onwatch.username);
    issues.required("onwatch.password", &onwatch.password);
    issues.required("onwatch.version", &onwatch.version);
    issues.ipv4("onwatch.ip_address", &onwatch.ip_address);
    if !onwatch.version.trim().is_empty() && onwatch.version.parse::<PlatformVersion>().is_err() {
        issues.error(
            "onwatch.version",
            format!(
                "unsupported version {:?} (supported: {})",
                onwatch.version,
                SUPPORTED_VERSIONS.join(", ")
            ),
        );
    }

    if let Some(ssh) = &config.ssh {
        issues.required("ssh.ip_address", &ssh.ip_address);
        issues.required("ssh.username", &ssh.username);
        issues.ipv4("ssh.ip_address", &ssh.ip_address);
    }

    if let Some(rancher) = &config.rancher {
        issues.ipv4("rancher.ip_address", &rancher.ip_address);
        if let Err(err) = rancher.port() {
            issues.error("rancher.port", err.to_string());
        }
        if rancher.base_url.is_none() && rancher.ip_address.trim().is_empty() {
            issues.error("rancher.ip_address", "required when rancher.base_url is not set");
        }
    }
    if !config.env_vars.is_empty() && config.rancher.is_none() {
        issues.warning("env_vars", "rancher section missing; configure-rancher will fail");
    }

    if let Some(interface) = &config.system_settings.system_interface {
        for (field, logo) in [
            ("company_logo", &interface.company_logo),
            ("sidebar_logo", &interface.sidebar_logo),
            ("favicon", &interface.favicon),
        ] {
            if let Some(logo) = logo {
                issues.file(
                    loaded,
                    &format!("system_settings.system_interface.{field}"),
                    logo,
                    Severity::Warning,
                );
            }
        }
        if let Some(translation) = &interface.translation_file {
            issues.file(
                loaded,
                "system_settings.system_interface.translation_file",
                translation,
                Severity::Error,
            );
            if config.ssh.is_none() {
                issues.warning(
                    "system_settings.system_interface.translation_file",
                    "ssh section missing; upload-files will fail",
                );
            }
        }
    }

    for (idx, group) in config.groups.subject_groups.iter().enumerate() {
        let path = format!("groups.subject_groups[{idx}]");
        if group.name.trim().is_empty() {
            issues.error(format!("{path}.name"), "required field is missing");
        }
        if group.priority > 0 && group.camera_groups.is_empty() {
            issues.warning(
                format!("{path}.priority"),
                "priority requires camera_groups; it will be sent as 0",
            );
        }
    }

    for (idx, user) in config.accounts.users.iter().enumerate() {
        let path = format!("accounts.users[{idx}]");
        issues.required(&format!("{path}.username"), &user.username);
        issues.required(&format!("{path}.role"), &user.role);
    }

    for (idx, subject) in config.watch_list.subjects.iter().enumerate() {
        let path = format!("watch_list.subjects[{idx}]");
        if subject.name.trim().is_empty() {
            issues.error(format!("{path}.name"), "required field is missing");
        }
        if subject.images.is_empty() {
            issues.warning(format!("{path}.images"), "no images declared; subject will not be created");
        }
        for (image_idx, image) in subject.images.iter().enumerate() {
            issues.file(
                loaded,
                &format!("{path}.images[{image_idx}]"),
                image.path(),
                Severity::Warning,
            );
        }
    }

    for (idx, device) in config.devices.iter().enumerate() {
        let path = format!("devices[{idx}]");
        if device.name.trim().is_empty() {
            issues.error(format!("{path}.name"), "required field is missing");
        }
        if device.video_url.trim().is_empty() {
            issues.warning(format!("{path}.video_url"), "missing; camera will be skipped");
        }
    }

    for (idx, inquiry) in config.inquiries.iter().enumerate() {
        let path = format!("inquiries[{idx}]");
        if inquiry.name.trim().is_empty() {
            issues.error(format!("{path}.name"), "required field is missing");
        }
        if let Some(Priority::Level(level)) = &inquiry.priority {
            let known = ["low", "medium", "high"];
            if !known.contains(&level.trim().to_lowercase().as_str()) {
                issues.warning(
                    format!("{path}.priority"),
                    format!("unknown priority {level:?}; Medium will be used"),
                );
            }
        }
        for (file_idx, file) in inquiry.files.iter().enumerate() {
            issues.file(
                loaded,
                &format!("{path}.files[{file_idx}]"),
                &file.path,
                Severity::Warning,
            );
        }
    }

    if let Some(mass_import) = &config.mass_import {
        issues.file(
            loaded,
            "mass_import.file_path",
            &mass_import.file_path,
            Severity::Warning,
        );
    }

    issues.0
}

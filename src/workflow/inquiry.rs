//! Inquiry cases: creation, forensic file uploads and the region-of-interest
//! pass for files marked `custom`.
use super::{prepared_handle, UploadOutcome, UploadPhase};
use crate::api::{id_of, Gateway};
use crate::config::{InquiryConfig, InquiryFileConfig, Padding, Priority};
use crate::poll::{poll_until, Backoff};
use crate::util::file_name_of;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const PRIORITY_HIGH: i64 = 1;
pub const PRIORITY_MEDIUM: i64 = 101;
pub const PRIORITY_LOW: i64 = 201;

pub const DEFAULT_FILE_THRESHOLD: f64 = 0.5;
pub const CUSTOM_FILE_THRESHOLD: f64 = 0.37;
pub const CUSTOM_PADDING: Padding = Padding {
    top: 15,
    right: 15,
    bottom: 22,
    left: 0,
};

const UPDATE_FILE_MEDIA: &str = "mutation updateFileMediaData($fileId: String!, $mediaData: FileMediaDataInput!) {\n  updateFileMediaData(fileId: $fileId, mediaData: $mediaData) {\n    code\n  }\n}\n";
const START_ANALYZE: &str = "mutation startAnalyzeFilesCase($caseId: String!, $fileIds: [String!]!) {\n  startAnalyzeFilesCase(caseId: $caseId, fileIds: $fileIds) {\n    code\n  }\n}\n";

/// Map a declared priority onto the appliance scale (1 = high, 201 = low).
///
/// Level names are case-insensitive; unknown names mean Medium and numbers
/// are clamped into range.
pub fn map_priority(priority: Option<&Priority>) -> i64 {
    match priority {
        None => PRIORITY_MEDIUM,
        Some(Priority::Number(value)) => {
            if value.is_nan() {
                PRIORITY_MEDIUM
            } else {
                (value.round() as i64).clamp(PRIORITY_HIGH, PRIORITY_LOW)
            }
        }
        Some(Priority::Level(level)) => match level.trim().to_lowercase().as_str() {
            "high" => PRIORITY_HIGH,
            "low" => PRIORITY_LOW,
            _ => PRIORITY_MEDIUM,
        },
    }
}

pub fn create_case(gateway: &Gateway<'_>, name: &str) -> Result<String> {
    let created = gateway
        .create("/inquiry-cases", json!({ "name": name }))
        .with_context(|| format!("create inquiry case {name}"))?;
    id_of(&created).ok_or_else(|| anyhow!("create inquiry case {name}: response has no id"))
}

pub fn set_priority(gateway: &Gateway<'_>, case_id: &str, priority: i64) -> Result<()> {
    gateway
        .patch(
            &format!("/inquiry-cases/{case_id}"),
            json!({ "priority": priority }),
        )
        .with_context(|| format!("set priority of inquiry case {case_id}"))?;
    Ok(())
}

/// Prepare, upload and attach one file. Errors before a handle exists are
/// returned directly; later failures become `UploadOutcome::Abandoned`.
pub fn upload_case_file(
    gateway: &Gateway<'_>,
    case_id: &str,
    path: &Path,
    threshold: f64,
) -> Result<UploadOutcome> {
    let file_name = file_name_of(path);
    let prepared = gateway
        .create(
            "/upload/prepare/forensic",
            json!({ "fileName": file_name, "withAnalysis": true }),
        )
        .with_context(|| format!("prepare upload of {file_name}"))?;
    let handle = prepared_handle(&prepared)
        .ok_or_else(|| anyhow!("prepare upload of {file_name}: response has no upload id"))?;

    if let Err(error) = gateway.upload_file(&format!("/upload/forensic/{handle}"), "file", path) {
        return Ok(UploadOutcome::Abandoned {
            handle,
            phase: UploadPhase::Upload,
            error,
        });
    }

    let attach = gateway.create(
        &format!("/inquiry-cases/{case_id}/files"),
        json!({ "uploadId": handle, "fileName": file_name, "threshold": threshold }),
    );
    match attach {
        Ok(_) => Ok(UploadOutcome::Attached { handle }),
        Err(err) => Ok(UploadOutcome::Abandoned {
            handle,
            phase: UploadPhase::Attach,
            error: err.into(),
        }),
    }
}

/// Wait for an attached file to be listed and return its analysis id
/// (`cameraId`), which differs from the upload handle.
pub fn resolve_analysis_id(
    gateway: &Gateway<'_>,
    case_id: &str,
    file_name: &str,
    backoff: &Backoff,
) -> Result<String> {
    let endpoint = format!("/inquiry-cases/{case_id}/files");
    let what = format!("analysis id of {file_name}");
    let id = poll_until(&what, backoff, || {
        let files = gateway.list_all(&endpoint)?;
        Ok(files
            .iter()
            .find(|file| {
                file.get("fileName")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name.eq_ignore_ascii_case(file_name))
            })
            .and_then(|file| file.get("cameraId").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string))
    })?;
    Ok(id)
}

/// Apply region-of-interest padding and threshold, then restart analysis.
pub fn configure_analysis(
    gateway: &Gateway<'_>,
    case_id: &str,
    analysis_id: &str,
    threshold: f64,
    padding: Padding,
) -> Result<()> {
    gateway
        .graphql(
            "updateFileMediaData",
            UPDATE_FILE_MEDIA,
            json!({
                "fileId": analysis_id,
                "mediaData": {
                    "threshold": threshold,
                    "cameraPadding": {
                        "top": padding.top,
                        "right": padding.right,
                        "bottom": padding.bottom,
                        "left": padding.left,
                    },
                },
            }),
        )
        .with_context(|| format!("update analysis settings of {analysis_id}"))?;
    gateway
        .graphql(
            "startAnalyzeFilesCase",
            START_ANALYZE,
            json!({ "caseId": case_id, "fileIds": [analysis_id] }),
        )
        .with_context(|| format!("restart analysis of {analysis_id}"))?;
    Ok(())
}

/// Everything that happened while provisioning one case.
#[derive(Debug, Default)]
pub struct CaseReport {
    pub case_id: String,
    pub priority: i64,
    pub attached: Vec<String>,
    pub abandoned: Vec<String>,
    pub configured: Vec<String>,
    pub warnings: Vec<String>,
}

struct CustomFile {
    file_name: String,
    threshold: f64,
    padding: Padding,
}

fn custom_settings(file: &InquiryFileConfig) -> CustomFile {
    CustomFile {
        file_name: file_name_of(&file.path),
        threshold: file.threshold.unwrap_or(CUSTOM_FILE_THRESHOLD),
        padding: file.padding.unwrap_or(CUSTOM_PADDING),
    }
}

/// Create a case, attach its files and run the custom-analysis pass.
///
/// Only case creation is fatal. File and analysis failures are collected as
/// warnings because the case stays usable.
pub fn provision_case(
    gateway: &Gateway<'_>,
    inquiry: &InquiryConfig,
    resolve: &dyn Fn(&Path) -> PathBuf,
    backoff: &Backoff,
) -> Result<CaseReport> {
    let name = inquiry.name.trim();
    let case_id = create_case(gateway, name)?;
    let priority = map_priority(inquiry.priority.as_ref());
    let mut report = CaseReport {
        case_id: case_id.clone(),
        priority,
        ..CaseReport::default()
    };
    if let Err(err) = set_priority(gateway, &case_id, priority) {
        report
            .warnings
            .push(format!("Inquiry '{name}': priority not set ({err:#})"));
    }

    let mut custom = Vec::new();
    for file in &inquiry.files {
        let path = resolve(&file.path);
        let file_name = file_name_of(&path);
        if !path.is_file() {
            report.warnings.push(format!(
                "Inquiry '{name}': file not found {}",
                path.display()
            ));
            continue;
        }
        let threshold = if file.is_custom() {
            CUSTOM_FILE_THRESHOLD
        } else {
            file.threshold.unwrap_or(DEFAULT_FILE_THRESHOLD)
        };
        match upload_case_file(gateway, &case_id, &path, threshold) {
            Ok(UploadOutcome::Attached { handle }) => {
                tracing::info!(inquiry = name, file = %file_name, handle = %handle, "file attached");
                report.attached.push(file_name);
                if file.is_custom() {
                    custom.push(custom_settings(file));
                }
            }
            Ok(outcome) => {
                if let Some(warning) =
                    outcome.orphan_warning(&format!("Inquiry '{name}' file {file_name}"))
                {
                    tracing::warn!(inquiry = name, file = %file_name, "{warning}");
                    report.warnings.push(warning);
                }
                report.abandoned.push(outcome.handle().to_string());
            }
            Err(err) => {
                tracing::warn!(inquiry = name, file = %file_name, error = %format!("{err:#}"), "file upload failed");
                report
                    .warnings
                    .push(format!("Inquiry '{name}': file {file_name} not added ({err:#})"));
            }
        }
    }

    for file in custom {
        let result = resolve_analysis_id(gateway, &case_id, &file.file_name, backoff).and_then(
            |analysis_id| {
                configure_analysis(gateway, &case_id, &analysis_id, file.threshold, file.padding)
            },
        );
        match result {
            Ok(()) => {
                tracing::info!(inquiry = name, file = %file.file_name, "custom analysis configured");
                report.configured.push(file.file_name);
            }
            Err(err) => report.warnings.push(format!(
                "Inquiry '{name}': custom analysis for {} not applied ({err:#}); configure it in the UI",
                file.file_name
            )),
        }
    }
    Ok(report)
}

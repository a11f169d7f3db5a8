//! Multi-call sequences that must look like one action to the stage driver.
//!
//! None of these retry; a failure is reported to the caller with whatever
//! partial state the appliance already holds.
pub mod branding;
pub mod camera;
pub mod inquiry;
pub mod kv;
pub mod subjects;

use crate::api::{id_field, id_of};
use serde_json::Value;
use std::fmt;

/// Phases of a prepare/upload/attach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Prepare,
    Upload,
    Attach,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadPhase::Prepare => "prepare",
            UploadPhase::Upload => "upload",
            UploadPhase::Attach => "attach",
        })
    }
}

/// How a multi-phase upload ended once a handle had been issued.
///
/// `Abandoned` means the server still holds a prepared slot nobody will use.
#[derive(Debug)]
pub enum UploadOutcome {
    Attached { handle: String },
    Abandoned {
        handle: String,
        phase: UploadPhase,
        error: anyhow::Error,
    },
}

impl UploadOutcome {
    pub fn handle(&self) -> &str {
        match self {
            UploadOutcome::Attached { handle } | UploadOutcome::Abandoned { handle, .. } => handle,
        }
    }

    /// Ledger text naming the possibly orphaned handle.
    pub fn orphan_warning(&self, what: &str) -> Option<String> {
        match self {
            UploadOutcome::Attached { .. } => None,
            UploadOutcome::Abandoned {
                handle,
                phase,
                error,
            } => Some(format!(
                "{what}: upload {handle} abandoned during {phase} ({error:#}); the server may keep an orphaned upload slot"
            )),
        }
    }
}

/// Handle returned by a "prepare upload" call: `[{id}]`, `{id}` or `{uploadId}`.
pub fn prepared_handle(response: &Value) -> Option<String> {
    match response {
        Value::Array(items) => items.first().and_then(id_of),
        other => id_of(other).or_else(|| id_field(other, "uploadId")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepared_handle_accepts_each_response_form() {
        assert_eq!(prepared_handle(&json!([{ "id": "a" }])).as_deref(), Some("a"));
        assert_eq!(prepared_handle(&json!({ "id": 7 })).as_deref(), Some("7"));
        assert_eq!(prepared_handle(&json!({ "uploadId": "u" })).as_deref(), Some("u"));
        assert_eq!(prepared_handle(&json!({ "status": "ok" })), None);
        assert_eq!(prepared_handle(&json!([])), None);
    }

    #[test]
    fn abandoned_uploads_name_the_orphan() {
        let outcome = UploadOutcome::Abandoned {
            handle: "upload-3".to_string(),
            phase: UploadPhase::Attach,
            error: anyhow::anyhow!("HTTP 500"),
        };
        let warning = outcome.orphan_warning("Inquiry 'Case A' file Neo.webm").unwrap();
        assert!(warning.contains("upload-3"));
        assert!(warning.contains("attach"));
        assert!(UploadOutcome::Attached {
            handle: "x".to_string()
        }
        .orphan_warning("x")
        .is_none());
    }
}

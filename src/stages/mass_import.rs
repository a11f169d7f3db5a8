//! Stage 9: bulk subject import from a prepared file.
use super::{StageContext, StageReport};
use crate::api::{is_already_exists, ApiError};
use crate::config::DEFAULT_MASS_IMPORT_GROUP;
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{live_entities, resolve_id, EntityKind};
use crate::util::file_name_of;
use crate::workflow::{prepared_handle, UploadOutcome, UploadPhase};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;

/// Similarity above which an imported face counts as an existing subject.
const DUPLICATION_THRESHOLD: f64 = 0.61;

pub(super) fn upload_mass_import(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let Some(import) = loaded
        .config
        .mass_import
        .as_ref()
        .filter(|import| !import.file_path.as_os_str().is_empty())
    else {
        return Ok(StageReport::idle("no mass import declared"));
    };
    let path = loaded.resolve(&import.file_path);
    if !path.is_file() {
        bail!("mass import file not found: {}", path.display());
    }
    let file_name = file_name_of(&path);
    let name = import
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| file_name.clone());
    let group_name = import
        .group
        .as_deref()
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .unwrap_or(DEFAULT_MASS_IMPORT_GROUP);

    let groups = live_entities(
        EntityKind::SubjectGroup,
        ctx.gateway.list_all("/groups").context("list subject groups")?,
    );
    let group_id = resolve_id(EntityKind::SubjectGroup, group_name, &groups).ok_or_else(|| {
        anyhow!("subject group '{group_name}' not found; run configure-groups first")
    })?;

    match ctx.gateway.get("/mass-import/quota") {
        Ok(quota) => tracing::info!(quota = %quota, "mass import quota"),
        Err(err) => tracing::debug!(error = %err, "mass import quota unavailable"),
    }

    let prepared = ctx.gateway.create(
        "/upload/prepare/mass-import",
        json!({
            "name": name,
            "fileName": file_name,
            "subjectGroupIds": [group_id],
            "isSearchBackwards": false,
            "duplicationThreshold": DUPLICATION_THRESHOLD,
        }),
    );
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(ApiError::AlreadyExists { .. }) => {
            ledger.add_skipped("Mass Import", &name, "already exists");
            return Ok(StageReport {
                skipped: 1,
                ..StageReport::default()
            });
        }
        Err(err) => return Err(err).context("prepare mass import"),
    };
    let handle = prepared_handle(&prepared)
        .ok_or_else(|| anyhow!("prepare mass import: response has no id"))?;

    let mut report = StageReport::default();
    match ctx
        .gateway
        .upload_file(&format!("/upload/mass-import/{handle}"), "file", &path)
    {
        Ok(_) => {
            tracing::info!(name = %name, id = %handle, file = %file_name, "mass import uploaded");
            ledger.add_created_item(
                Category::MassImport,
                json!({ "name": name, "id": handle, "file": file_name, "group": group_name }),
            );
            report.applied += 1;
        }
        Err(err) if is_already_exists(&err) => {
            ledger.add_skipped("Mass Import", &name, "already exists");
            report.skipped += 1;
        }
        Err(error) => {
            let outcome = UploadOutcome::Abandoned {
                handle,
                phase: UploadPhase::Upload,
                error,
            };
            if let Some(warning) = outcome.orphan_warning(&format!("Mass import '{name}'")) {
                ledger.add_warning(warning);
            }
            ledger.add_error("Mass Import", &name, "file upload failed");
            report.failed += 1;
        }
    }
    Ok(report)
}

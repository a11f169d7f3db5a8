//! Stages 2 and 3: KV parameters and the system settings document.
use super::{StageContext, StageReport};
use crate::config::scalar_text;
use crate::ledger::{Category, RunLedger};
use crate::reconcile::EntityKind;
use crate::workflow::branding::{
    create_acknowledge_action, enable_acknowledge_actions, register_logo, system_settings_payload,
    upload_logo, LogoFolder,
};
use crate::workflow::kv::{apply_kv, read_kv, values_match, KvOutcome};
use crate::util::file_name_of;
use crate::workflow::UploadOutcome;
use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;

pub(super) fn set_kv_parameters(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let declared = &loaded.config.kv_parameters;
    if declared.is_empty() {
        return Ok(StageReport::idle("no KV parameters declared"));
    }
    let kind = EntityKind::KvSetting.label();
    let mut report = StageReport::default();
    for (key, value) in declared {
        let value = scalar_text(value);
        let current = read_kv(&ctx.gateway, &mut ctx.settings, key).unwrap_or_else(|err| {
            tracing::debug!(key, error = %format!("{err:#}"), "current KV value unknown");
            None
        });
        if current
            .as_deref()
            .is_some_and(|current| values_match(&value, current))
        {
            tracing::info!(key, value = %value, "KV parameter already set");
            ledger.add_skipped(kind, key, "already set");
            report.skipped += 1;
            continue;
        }
        match apply_kv(&ctx.gateway, &mut ctx.settings, key, &value, &ctx.backoff) {
            Ok(KvOutcome::Verified(actual)) => {
                ledger.add_created_item(
                    Category::KvParameters,
                    json!({ "key": key, "value": actual, "expected_value": value }),
                );
                report.applied += 1;
            }
            Ok(KvOutcome::Unverified(seen)) => {
                ledger.add_warning(format!(
                    "KV parameter '{key}' was written but reads back as {} instead of '{value}'",
                    seen.as_deref().map_or("nothing".to_string(), |seen| format!("'{seen}'"))
                ));
                report.incomplete += 1;
            }
            Err(err) => {
                tracing::error!(key, error = %format!("{err:#}"), "KV parameter not set");
                ledger.add_error(kind, key, &format!("{err:#}"));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

pub(super) fn configure_system(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let settings = &loaded.config.system_settings;
    let mut report = StageReport::default();

    let payload = system_settings_payload(settings);
    if payload.as_object().is_some_and(|fields| !fields.is_empty()) {
        match ctx.settings.patch(&ctx.gateway, payload.clone()) {
            Ok(()) => {
                tracing::info!("system settings updated");
                ledger.add_created_item(Category::SystemSettings, payload);
                report.applied += 1;
            }
            Err(err) => {
                ledger.add_error("System Settings", "settings", &format!("{err:#}"));
                report.failed += 1;
            }
        }
    }

    if let Some(map) = &settings.map {
        if map.acknowledge {
            match enable_acknowledge_actions(&ctx.gateway, true) {
                Ok(()) => {
                    ledger.add_created_item(Category::SystemSettings, json!({ "acknowledgeActions": true }));
                    report.applied += 1;
                }
                Err(err) => {
                    ledger.add_error("Acknowledge Actions", "enforcement", &format!("{err:#}"));
                    report.failed += 1;
                }
            }
        }
        if let Some(title) = map.action_title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
            let description = map.action_description.as_deref().unwrap_or_default();
            match create_acknowledge_action(&ctx.gateway, title, description) {
                Ok(true) => {
                    ledger.add_created_item(Category::SystemSettings, json!({ "acknowledgeAction": title }));
                    report.applied += 1;
                }
                Ok(false) => {
                    ledger.add_skipped("Acknowledge Action", title, "already exists");
                    report.skipped += 1;
                }
                Err(err) => {
                    ledger.add_error("Acknowledge Action", title, &format!("{err:#}"));
                    report.failed += 1;
                }
            }
        }
    }

    if let Some(interface) = &settings.system_interface {
        let logos = [
            (LogoFolder::Company, &interface.company_logo),
            (LogoFolder::Sidebar, &interface.sidebar_logo),
            (LogoFolder::Favicon, &interface.favicon),
        ];
        for (folder, path) in logos {
            if let Some(path) = path {
                let path = loaded.resolve(path);
                apply_logo(ctx, ledger, &mut report, folder, &path);
            }
        }
    }

    if report.total() == 0 {
        return Ok(StageReport::idle("no system settings declared"));
    }
    Ok(report)
}

fn apply_logo(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
    report: &mut StageReport,
    folder: LogoFolder,
    path: &Path,
) {
    let file_name = file_name_of(path);
    let label = format!("{} logo", folder.folder());
    if !path.is_file() {
        ledger.add_error("Logo", &label, &format!("file not found: {}", path.display()));
        report.failed += 1;
        return;
    }
    match upload_logo(&ctx.gateway, folder, path) {
        Ok(UploadOutcome::Attached { .. }) => {
            match register_logo(&ctx.gateway, &mut ctx.settings, folder, &file_name) {
                Ok(()) => {
                    let mut record = serde_json::Map::new();
                    record.insert(folder.white_label_field().to_string(), Value::String(file_name));
                    ledger.add_created_item(Category::SystemSettings, Value::Object(record));
                    report.applied += 1;
                }
                Err(err) => {
                    ledger.add_warning(format!(
                        "{label} {file_name} was uploaded but not registered in the branding settings ({err:#}); select it manually in the UI"
                    ));
                    report.incomplete += 1;
                }
            }
        }
        Ok(outcome) => {
            if let Some(warning) = outcome.orphan_warning(&label) {
                ledger.add_warning(warning);
            }
            report.failed += 1;
        }
        Err(err) => {
            ledger.add_error("Logo", &label, &format!("{err:#}"));
            report.failed += 1;
        }
    }
}

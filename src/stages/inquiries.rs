//! Stage 8: inquiry cases and their forensic files.
use super::{StageContext, StageReport};
use crate::api::is_already_exists;
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{decide, live_entities, Decision, EntityKind, LiveEntity};
use crate::workflow::inquiry::provision_case;
use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

pub(super) fn configure_inquiries(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let inquiries = &loaded.config.inquiries;
    if inquiries.is_empty() {
        return Ok(StageReport::idle("no inquiries declared"));
    }
    let mut report = StageReport::default();
    let mut live = live_entities(
        EntityKind::InquiryCase,
        ctx.gateway
            .list_all("/inquiry-cases")
            .context("list inquiry cases")?,
    );
    let resolve = |path: &Path| loaded.resolve(path);

    for inquiry in inquiries {
        let name = inquiry.name.trim();
        if name.is_empty() {
            ledger.add_warning("inquiry without a name ignored");
            continue;
        }
        if let Decision::Skip(_) = decide(EntityKind::InquiryCase, name, &live) {
            ledger.add_skipped(EntityKind::InquiryCase.label(), name, "already exists");
            report.skipped += 1;
            continue;
        }
        match provision_case(&ctx.gateway, inquiry, &resolve, &ctx.backoff) {
            Ok(case) => {
                ledger.add_created_item(
                    Category::Inquiries,
                    json!({
                        "name": name,
                        "id": case.case_id,
                        "priority": case.priority,
                        "files": case.attached,
                    }),
                );
                live.push(LiveEntity {
                    id: Some(case.case_id.clone()),
                    name: name.to_string(),
                    raw: json!({ "id": case.case_id, "name": name }),
                });
                let clean = case.warnings.is_empty();
                for warning in case.warnings {
                    ledger.add_warning(warning);
                }
                if clean {
                    report.applied += 1;
                } else {
                    report.incomplete += 1;
                }
            }
            Err(err) if is_already_exists(&err) => {
                ledger.add_skipped(EntityKind::InquiryCase.label(), name, "already exists");
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(inquiry = name, error = %format!("{err:#}"), "inquiry case not created");
                ledger.add_error(EntityKind::InquiryCase.label(), name, &format!("{err:#}"));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

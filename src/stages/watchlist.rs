//! Stage 6: watch-list subjects and the group they join.
use super::groups::{learned_profiles, subject_group_body};
use super::{reconcile_create, Reconciled, StageContext, StageReport};
use crate::api::gateway::ListOptions;
use crate::api::is_already_exists;
use crate::config::{SubjectConfig, SubjectGroupConfig, DEFAULT_GROUP_NAME};
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{decide, live_entities, resolve_id, Decision, EntityKind, LiveEntity};
use crate::util::file_name_of;
use crate::workflow::subjects::{create_subject, top_up_subject};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub(super) fn populate_watch_list(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let subjects = &loaded.config.watch_list.subjects;
    if subjects.is_empty() {
        return Ok(StageReport::idle("no watch-list subjects declared"));
    }
    let mut report = StageReport::default();

    let mut groups = GroupResolver {
        live: live_entities(
            EntityKind::SubjectGroup,
            ctx.gateway.list_all("/groups").context("list subject groups")?,
        ),
        resolved: BTreeMap::new(),
    };
    let mut live = live_entities(
        EntityKind::Subject,
        ctx.gateway
            .list_subjects(ListOptions::default())
            .context("list subjects")?
            .into_records("/subjects"),
    );

    for subject in subjects {
        let name = subject.name.trim();
        if name.is_empty() {
            ledger.add_warning("subject without a name ignored");
            continue;
        }
        let images = existing_images(ctx, ledger, subject);
        if images.is_empty() {
            ledger.add_error(EntityKind::Subject.label(), name, "no usable images");
            report.failed += 1;
            continue;
        }

        if let Decision::Skip(existing) = decide(EntityKind::Subject, name, &live) {
            let Some(id) = existing.id.clone() else {
                ledger.add_skipped(EntityKind::Subject.label(), name, "already exists");
                report.skipped += 1;
                continue;
            };
            match top_up_subject(&ctx.gateway, name, &id, &images) {
                Ok(top_up) => {
                    let reason = if top_up.added > 0 {
                        format!("existed, added {} missing image(s)", top_up.added)
                    } else {
                        "already exists".to_string()
                    };
                    ledger.add_skipped(EntityKind::Subject.label(), name, &reason);
                    for (path, err) in &top_up.failed_images {
                        ledger.add_warning(image_warning(name, "exists", path, err));
                    }
                    if let Some(err) = &top_up.unverified {
                        ledger.add_warning(primary_warning(name, "exists", err));
                    }
                    if top_up.failed_images.is_empty() && top_up.unverified.is_none() {
                        report.skipped += 1;
                    } else {
                        report.incomplete += 1;
                    }
                }
                Err(err) => {
                    ledger.add_error(EntityKind::Subject.label(), name, &format!("{err:#}"));
                    report.failed += 1;
                }
            }
            continue;
        }

        let group_name = subject
            .group
            .as_deref()
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .unwrap_or(DEFAULT_GROUP_NAME);
        let group_id = match groups.id_for(ctx, ledger, group_name) {
            Ok(id) => id,
            Err(err) => {
                ledger.add_warning(format!(
                    "Subject '{name}' created without a group: {err:#}"
                ));
                None
            }
        };

        match create_subject(&ctx.gateway, name, group_id.as_deref(), &images) {
            Ok(created) => {
                ledger.add_created_item(
                    Category::Subjects,
                    json!({
                        "name": name,
                        "id": created.id,
                        "images": created.images,
                        "group": group_name,
                    }),
                );
                live.push(LiveEntity {
                    id: Some(created.id.clone()),
                    name: name.to_string(),
                    raw: json!({ "id": created.id, "name": name }),
                });
                for (path, err) in &created.failed_images {
                    ledger.add_warning(image_warning(name, "was created", path, err));
                }
                if let Some(err) = &created.unverified {
                    ledger.add_warning(primary_warning(name, "was created", err));
                }
                if created.failed_images.is_empty() && created.unverified.is_none() {
                    report.applied += 1;
                } else {
                    report.incomplete += 1;
                }
            }
            Err(err) if is_already_exists(&err) => {
                ledger.add_skipped(EntityKind::Subject.label(), name, "already exists");
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(subject = name, error = %format!("{err:#}"), "subject not created");
                ledger.add_error(EntityKind::Subject.label(), name, &format!("{err:#}"));
                ledger.add_warning(format!(
                    "Subject '{name}' was not created. You may need to add it manually in the UI."
                ));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn image_warning(name: &str, state: &str, path: &std::path::Path, err: &anyhow::Error) -> String {
    format!(
        "Subject '{name}' {state} but additional image {} was not added ({err:#}). You may need to add it manually in the UI.",
        file_name_of(path)
    )
}

fn primary_warning(name: &str, state: &str, err: &anyhow::Error) -> String {
    format!(
        "Subject '{name}' {state} but its primary image could not be confirmed ({err:#}). Check it in the UI."
    )
}

/// Declared image paths that exist on disk, in declared order.
fn existing_images(
    ctx: &StageContext<'_>,
    ledger: &mut RunLedger,
    subject: &SubjectConfig,
) -> Vec<PathBuf> {
    let mut images = Vec::new();
    for image in &subject.images {
        let path = ctx.loaded.resolve(image.path());
        if path.is_file() {
            images.push(path);
        } else {
            ledger.add_warning(format!(
                "Subject '{}': image not found: {}",
                subject.name.trim(),
                path.display()
            ));
        }
    }
    images
}

/// Group ids by declared name, creating the default group on first need.
struct GroupResolver {
    live: Vec<LiveEntity>,
    resolved: BTreeMap<String, Option<String>>,
}

impl GroupResolver {
    fn id_for(
        &mut self,
        ctx: &StageContext<'_>,
        ledger: &mut RunLedger,
        declared: &str,
    ) -> Result<Option<String>> {
        if let Some(id) = self.resolved.get(declared) {
            return Ok(id.clone());
        }
        let id = match resolve_id(EntityKind::SubjectGroup, declared, &self.live) {
            Some(id) => Some(id),
            None => {
                if declared != DEFAULT_GROUP_NAME {
                    ledger.add_warning(format!(
                        "Subject group '{declared}' not found; using '{DEFAULT_GROUP_NAME}'"
                    ));
                }
                self.default_group(ctx, ledger)?
            }
        };
        self.resolved.insert(declared.to_string(), id.clone());
        Ok(id)
    }

    fn default_group(
        &mut self,
        ctx: &StageContext<'_>,
        ledger: &mut RunLedger,
    ) -> Result<Option<String>> {
        let group = SubjectGroupConfig::default_group();
        let profiles = learned_profiles(&ctx.loaded.config.groups.profiles, &self.live);
        let body = subject_group_body(&group, &profiles, Vec::new());
        match reconcile_create(
            &ctx.gateway,
            EntityKind::SubjectGroup,
            "/groups",
            &group.name,
            body,
            &mut self.live,
        )? {
            Reconciled::Created { id, .. } => {
                ledger.add_created_item(
                    Category::Groups,
                    json!({ "name": group.name, "id": id, "type": "subject_group" }),
                );
                Ok(Some(id))
            }
            Reconciled::Existing { id, .. } => Ok(id),
        }
    }
}

//! Stage 4: camera groups, then subject groups bound to them.
use super::{exists_reason, reconcile_create, Reconciled, StageContext, StageReport};
use crate::config::{ProfileIds, SubjectGroupConfig};
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{live_entities, resolve_id, EntityKind, LiveEntity};
use anyhow::{Context, Result};
use serde_json::{json, Value};

pub(super) fn configure_groups(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let groups = &loaded.config.groups;
    if groups.subject_groups.is_empty() && groups.device_groups.is_empty() {
        return Ok(StageReport::idle("no groups declared"));
    }
    let mut report = StageReport::default();

    let mut camera_groups = live_entities(
        EntityKind::CameraGroup,
        ctx.gateway
            .list_all("/camera-groups")
            .context("list camera groups")?,
    );
    for declared in &groups.device_groups {
        let name = declared.name.trim();
        if name.is_empty() {
            ledger.add_warning("device group without a name ignored");
            continue;
        }
        let body = json!({ "title": name, "description": declared.description });
        match reconcile_create(
            &ctx.gateway,
            EntityKind::CameraGroup,
            "/camera-groups",
            name,
            body,
            &mut camera_groups,
        ) {
            Ok(Reconciled::Created { id, .. }) => {
                ledger.add_created_item(
                    Category::Groups,
                    json!({ "name": name, "id": id, "type": "camera_group" }),
                );
                report.applied += 1;
            }
            Ok(Reconciled::Existing { name: live, .. }) => {
                ledger.add_skipped(EntityKind::CameraGroup.label(), name, &exists_reason(name, &live));
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(name, error = %format!("{err:#}"), "camera group not created");
                ledger.add_error(EntityKind::CameraGroup.label(), name, &format!("{err:#}"));
                report.failed += 1;
            }
        }
    }

    if groups.subject_groups.is_empty() {
        return Ok(report);
    }
    let mut live = live_entities(
        EntityKind::SubjectGroup,
        ctx.gateway.list_all("/groups").context("list subject groups")?,
    );
    let profiles = learned_profiles(&groups.profiles, &live);
    for declared in &groups.subject_groups {
        let name = declared.name.trim();
        if name.is_empty() {
            ledger.add_warning("subject group without a name ignored");
            continue;
        }
        if declared.priority > 0 && declared.camera_groups.is_empty() {
            ledger.add_warning(format!(
                "Subject group '{name}' sets priority {} without camera groups; priority forced to 0",
                declared.priority
            ));
        }
        let mut bound = Vec::new();
        for camera_group in &declared.camera_groups {
            match resolve_id(EntityKind::CameraGroup, camera_group, &camera_groups) {
                Some(id) => bound.push(id),
                None => ledger.add_warning(format!(
                    "Subject group '{name}': camera group '{camera_group}' not found"
                )),
            }
        }
        let body = subject_group_body(declared, &profiles, bound);
        match reconcile_create(
            &ctx.gateway,
            EntityKind::SubjectGroup,
            "/groups",
            name,
            body,
            &mut live,
        ) {
            Ok(Reconciled::Created { id, .. }) => {
                ledger.add_created_item(
                    Category::Groups,
                    json!({ "name": name, "id": id, "type": "subject_group" }),
                );
                report.applied += 1;
            }
            Ok(Reconciled::Existing { name: existing, .. }) => {
                tracing::info!(name, existing = %existing, "subject group already exists");
                ledger.add_skipped(
                    EntityKind::SubjectGroup.label(),
                    name,
                    &exists_reason(name, &existing),
                );
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(name, error = %format!("{err:#}"), "subject group not created");
                ledger.add_error(EntityKind::SubjectGroup.label(), name, &format!("{err:#}"));
                ledger.add_warning(format!(
                    "Subject group '{name}' was not created. You may need to create it manually in the UI."
                ));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Create body for a subject group.
pub(super) fn subject_group_body(
    group: &SubjectGroupConfig,
    profiles: &ProfileIds,
    camera_group_ids: Vec<String>,
) -> Value {
    json!({
        "title": group.name.trim(),
        "description": group.description,
        "color": group.color,
        "priority": group.effective_priority(),
        "authorization": group.authorization,
        "visibilityProfileId": profiles.visibility_id(&group.visibility),
        "alertLevelId": profiles.alert_level_id(&group.authorization),
        "cameraGroups": camera_group_ids,
    })
}

/// Configured profile ids, completed with the mappings live groups expose.
pub(super) fn learned_profiles(configured: &ProfileIds, live: &[LiveEntity]) -> ProfileIds {
    let mut profiles = configured.clone();
    for group in live {
        let pair = |label: &str, id: &str| {
            let label = group.raw.get(label).and_then(Value::as_str)?.trim();
            let id = group.raw.get(id).and_then(Value::as_str)?.trim();
            (!label.is_empty() && !id.is_empty()).then(|| (label.to_string(), id.to_string()))
        };
        if let Some((visibility, id)) = pair("visibility", "visibilityProfileId") {
            profiles.visibility.entry(visibility).or_insert(id);
        }
        if let Some((authorization, id)) = pair("authorization", "alertLevelId") {
            profiles.alert_levels.entry(authorization).or_insert(id);
        }
    }
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StepStatus;
    use crate::stages::tests::{context, ledger, loaded, FakeConnector, HEADER};
    use crate::testing::FakeOnWatch;

    #[test]
    fn camera_groups_are_created_before_subject_groups_bind_them() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOnWatch::new();
        let yaml = format!(
            "{HEADER}groups:\n  device_groups:\n    - name: Entrances\n  subject_groups:\n    - name: VIP\n      authorization: Always Authorized\n      visibility: Loud\n      priority: 3\n      camera_groups: [Entrances, Parking]\n    - name: Staff\n      priority: 2\n"
        );
        let loaded = loaded(dir.path(), &yaml);
        let connector = FakeConnector::new(&fake);
        let mut ctx = context(&loaded, &connector);
        let mut ledger = ledger();

        let report = configure_groups(&mut ctx, &mut ledger).unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.status(), StepStatus::Success);

        let camera_group_id = fake.camera_groups()[0]["id"].clone();
        let groups = fake.groups();
        let vip = groups.iter().find(|group| group["title"] == "VIP").unwrap();
        assert_eq!(vip["cameraGroups"], json!([camera_group_id]));
        assert_eq!(vip["priority"], 3);
        let staff = groups.iter().find(|group| group["title"] == "Staff").unwrap();
        assert_eq!(staff["priority"], 0);
        assert_eq!(staff["authorization"], "Always Unauthorized");

        assert!(ledger.warnings().iter().any(|warning| warning.contains("'Parking' not found")));
        assert!(ledger.warnings().iter().any(|warning| warning.contains("priority forced to 0")));
        let recorded = ledger.created(Category::Groups).as_array().unwrap().clone();
        assert_eq!(
            recorded.iter().map(|item| item["type"].as_str().unwrap()).collect::<Vec<_>>(),
            vec!["camera_group", "subject_group", "subject_group"]
        );
    }

    #[test]
    fn profile_ids_learned_from_live_groups_win_over_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOnWatch::new();
        let yaml = format!(
            "{HEADER}groups:\n  subject_groups:\n    - name: Visitors\n      visibility: Visible\n"
        );
        let loaded = loaded(dir.path(), &yaml);
        let connector = FakeConnector::new(&fake);
        let mut ctx = context(&loaded, &connector);
        ctx.gateway
            .create(
                "/groups",
                json!({ "title": "Existing", "visibility": "Visible", "visibilityProfileId": "site-visible" }),
            )
            .unwrap();

        configure_groups(&mut ctx, &mut ledger()).unwrap();
        let groups = fake.groups();
        let visitors = groups.iter().find(|group| group["title"] == "Visitors").unwrap();
        assert_eq!(visitors["visibilityProfileId"], "site-visible");
        assert_eq!(
            visitors["alertLevelId"],
            ProfileIds::default().alert_level_id("Always Unauthorized").unwrap()
        );
    }

    #[test]
    fn create_failure_is_an_entity_error_with_manual_warning() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOnWatch::new();
        fake.fail("POST /groups");
        let yaml = format!("{HEADER}groups:\n  subject_groups:\n    - name: VIP\n");
        let loaded = loaded(dir.path(), &yaml);
        let connector = FakeConnector::new(&fake);
        let mut ctx = context(&loaded, &connector);
        let mut ledger = ledger();

        let report = configure_groups(&mut ctx, &mut ledger).unwrap();
        assert_eq!(report.status(), StepStatus::Failed);
        assert!(ledger.errors()[0].starts_with("Subject Group: VIP"));
        assert!(ledger.warnings()[0].contains("create it manually in the UI"));
        assert!(ledger.created(Category::Groups).as_array().unwrap().is_empty());
    }
}

//! Stage 5: user groups, then the users that reference them.
use super::{exists_reason, reconcile_create, Reconciled, StageContext, StageReport};
use crate::api::id_of;
use crate::config::UserConfig;
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{live_entities, resolve_id, EntityKind, LiveEntity};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub(super) fn configure_accounts(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let accounts = &loaded.config.accounts;
    if accounts.users.is_empty() && accounts.user_groups.is_empty() {
        return Ok(StageReport::idle("no accounts declared"));
    }
    let mut report = StageReport::default();

    let mut user_groups = live_entities(
        EntityKind::UserGroup,
        ctx.gateway
            .list_all("/user-groups")
            .context("list user groups")?,
    );
    if !accounts.user_groups.is_empty() {
        let subject_groups = live_entities(
            EntityKind::SubjectGroup,
            ctx.gateway.list_all("/groups").context("list subject groups")?,
        );
        let camera_groups = live_entities(
            EntityKind::CameraGroup,
            ctx.gateway
                .list_all("/camera-groups")
                .context("list camera groups")?,
        );
        for declared in &accounts.user_groups {
            let name = declared.display_name();
            if name.is_empty() {
                ledger.add_warning("user group without a title ignored");
                continue;
            }
            let subject_group_ids = resolve_all(
                ledger,
                name,
                EntityKind::SubjectGroup,
                &declared.subject_groups,
                &subject_groups,
            );
            let camera_group_ids = resolve_all(
                ledger,
                name,
                EntityKind::CameraGroup,
                &declared.camera_groups,
                &camera_groups,
            );
            let body = json!({
                "title": name,
                "subjectGroups": subject_group_ids,
                "cameraGroups": camera_group_ids,
            });
            match reconcile_create(
                &ctx.gateway,
                EntityKind::UserGroup,
                "/user-groups",
                name,
                body,
                &mut user_groups,
            ) {
                Ok(Reconciled::Created { id, .. }) => {
                    ledger.add_created_item(
                        Category::Accounts,
                        json!({ "type": "user_group", "name": name, "id": id }),
                    );
                    report.applied += 1;
                }
                Ok(Reconciled::Existing { name: live, .. }) => {
                    ledger.add_skipped(EntityKind::UserGroup.label(), name, &exists_reason(name, &live));
                    report.skipped += 1;
                }
                Err(err) => {
                    ledger.add_error(EntityKind::UserGroup.label(), name, &format!("{err:#}"));
                    report.failed += 1;
                }
            }
        }
    }

    if accounts.users.is_empty() {
        return Ok(report);
    }
    let roles = role_ids(ctx.gateway.list_all("/roles").context("list roles")?);
    let mut users = live_entities(
        EntityKind::User,
        ctx.gateway.list_all("/users").context("list users")?,
    );
    for declared in &accounts.users {
        let username = declared.username.trim();
        if username.is_empty() {
            ledger.add_warning("user without a username ignored");
            continue;
        }
        let body = match user_body(declared, &roles, &user_groups) {
            Ok(body) => body,
            Err(reason) => {
                tracing::error!(username, reason = %reason, "user not created");
                ledger.add_error(EntityKind::User.label(), username, &reason);
                report.failed += 1;
                continue;
            }
        };
        match reconcile_create(
            &ctx.gateway,
            EntityKind::User,
            "/users",
            username,
            body,
            &mut users,
        ) {
            Ok(Reconciled::Created { id, .. }) => {
                ledger.add_created_item(
                    Category::Accounts,
                    json!({
                        "type": "user",
                        "username": username,
                        "id": id,
                        "role": declared.role.trim(),
                    }),
                );
                report.applied += 1;
            }
            Ok(Reconciled::Existing { .. }) => {
                ledger.add_skipped(EntityKind::User.label(), username, "already exists");
                report.skipped += 1;
            }
            Err(err) => {
                ledger.add_error(EntityKind::User.label(), username, &format!("{err:#}"));
                ledger.add_warning(format!(
                    "User '{username}' was not created. You may need to create it manually in the UI."
                ));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn resolve_all(
    ledger: &mut RunLedger,
    owner: &str,
    kind: EntityKind,
    names: &[String],
    live: &[LiveEntity],
) -> Vec<String> {
    let mut ids = Vec::new();
    for name in names {
        match resolve_id(kind, name, live) {
            Some(id) => ids.push(id),
            None => ledger.add_warning(format!(
                "User group '{owner}': {} '{name}' not found",
                kind.label().to_lowercase()
            )),
        }
    }
    ids
}

/// Role names compare case-insensitively with `_`/`-` read as spaces.
fn role_key(name: &str) -> String {
    let key = name.trim().to_lowercase().replace(['_', '-'], " ");
    match key.as_str() {
        "superadmin" => "super admin".to_string(),
        _ => key,
    }
}

fn role_ids(records: Vec<Value>) -> BTreeMap<String, String> {
    records
        .iter()
        .filter_map(|role| {
            let title = role
                .get("title")
                .or_else(|| role.get("name"))
                .and_then(Value::as_str)?;
            Some((role_key(title), id_of(role)?))
        })
        .collect()
}

/// Create body for a user. The error names the unresolved reference.
fn user_body(
    user: &UserConfig,
    roles: &BTreeMap<String, String>,
    user_groups: &[LiveEntity],
) -> std::result::Result<Value, String> {
    let role = user.role.trim();
    let role_id = roles
        .get(&role_key(role))
        .ok_or_else(|| format!("role '{role}' not found"))?;
    let mut body = Map::new();
    body.insert("username".into(), json!(user.username.trim()));
    body.insert("firstName".into(), json!(user.first_name));
    body.insert("lastName".into(), json!(user.last_name));
    body.insert("roleId".into(), json!(role_id));
    if let Some(email) = user.email.as_deref().filter(|email| !email.trim().is_empty()) {
        body.insert("email".into(), json!(email.trim()));
    }
    let group = user.user_group.trim();
    if !group.is_empty() {
        let group_id = resolve_id(EntityKind::UserGroup, group, user_groups)
            .ok_or_else(|| format!("user group '{group}' not found"))?;
        body.insert("userGroupId".into(), json!(group_id));
    }
    if let Some(password) = user.effective_password() {
        body.insert("password".into(), json!(password));
    }
    Ok(Value::Object(body))
}

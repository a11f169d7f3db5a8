//! Stage 7: cameras.
use super::{reconcile_create, Reconciled, StageContext, StageReport};
use crate::api::is_already_exists;
use crate::config::{DeviceConfig, DEFAULT_CAMERA_GROUP_NAME};
use crate::ledger::{Category, RunLedger};
use crate::reconcile::{decide, live_entities, resolve_id, Decision, EntityKind, LiveEntity};
use crate::workflow::camera::{camera_input, create_camera};
use anyhow::{Context, Result};
use serde_json::json;

pub(super) fn configure_devices(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let devices = &loaded.config.devices;
    if devices.is_empty() {
        return Ok(StageReport::idle("no devices declared"));
    }
    let mut report = StageReport::default();

    // One listing for the whole stage.
    let mut cameras = live_entities(
        EntityKind::Camera,
        ctx.gateway.list_all("/cameras").context("list cameras")?,
    );
    let mut camera_groups = live_entities(
        EntityKind::CameraGroup,
        ctx.gateway
            .list_all("/camera-groups")
            .context("list camera groups")?,
    );

    for device in devices {
        let name = device.name.trim();
        if name.is_empty() {
            ledger.add_warning("device without a name ignored");
            continue;
        }
        if device.video_url.trim().is_empty() {
            ledger.add_skipped(EntityKind::Camera.label(), name, "no video_url");
            report.skipped += 1;
            continue;
        }
        if let Decision::Skip(existing) = decide(EntityKind::Camera, name, &cameras) {
            tracing::info!(camera = name, id = ?existing.id, "camera already exists");
            ledger.add_skipped(EntityKind::Camera.label(), name, "already exists");
            report.skipped += 1;
            continue;
        }
        let group_id = match camera_group_for(ctx, ledger, device, &mut camera_groups) {
            Ok(id) => id,
            Err(err) => {
                ledger.add_warning(format!(
                    "Camera '{name}' has no camera group: {err:#}"
                ));
                None
            }
        };
        match create_camera(&ctx.gateway, camera_input(device, group_id.as_deref())) {
            Ok(id) => {
                ledger.add_created_item(
                    Category::Cameras,
                    json!({ "name": name, "id": id, "video_url": device.video_url.trim() }),
                );
                cameras.push(LiveEntity {
                    id: Some(id.clone()),
                    name: name.to_string(),
                    raw: json!({ "id": id, "title": name }),
                });
                report.applied += 1;
            }
            Err(err) if is_already_exists(&err) => {
                ledger.add_skipped(EntityKind::Camera.label(), name, "already exists");
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(camera = name, error = %format!("{err:#}"), "camera not created");
                ledger.add_error(EntityKind::Camera.label(), name, &format!("{err:#}"));
                ledger.add_warning(format!(
                    "Camera '{name}' was not created. You may need to add it manually in the UI."
                ));
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// The declared camera group, else the first live one, else a freshly
/// created default group.
fn camera_group_for(
    ctx: &StageContext<'_>,
    ledger: &mut RunLedger,
    device: &DeviceConfig,
    live: &mut Vec<LiveEntity>,
) -> Result<Option<String>> {
    if let Some(declared) = device
        .camera_group
        .as_deref()
        .map(str::trim)
        .filter(|group| !group.is_empty())
    {
        if let Some(id) = resolve_id(EntityKind::CameraGroup, declared, live) {
            return Ok(Some(id));
        }
        ledger.add_warning(format!(
            "Camera '{}': camera group '{declared}' not found",
            device.name.trim()
        ));
    }
    if let Some(first) = live.iter().find_map(|group| group.id.clone()) {
        return Ok(Some(first));
    }
    let body = json!({
        "title": DEFAULT_CAMERA_GROUP_NAME,
        "description": "Default camera group created automatically",
    });
    match reconcile_create(
        &ctx.gateway,
        EntityKind::CameraGroup,
        "/camera-groups",
        DEFAULT_CAMERA_GROUP_NAME,
        body,
        live,
    )? {
        Reconciled::Created { id, .. } => {
            ledger.add_created_item(
                Category::Groups,
                json!({ "name": DEFAULT_CAMERA_GROUP_NAME, "id": id, "type": "camera_group" }),
            );
            Ok(Some(id))
        }
        Reconciled::Existing { id, .. } => Ok(id),
    }
}

//! System settings, branding logos and acknowledge actions.
//!
//! All writes to the settings document go through [`SettingsCache::patch`],
//! which drops the cached copy after every write.
use super::{prepared_handle, UploadOutcome, UploadPhase};
use crate::api::{is_already_exists, Gateway};
use crate::config::SystemSettings;
use crate::util::file_name_of;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::path::Path;

const UPDATE_SETTINGS: &str = "mutation updateSettings($settings: SettingsInput!) {\n  updateSettings(settings: $settings) {\n    code\n  }\n}\n";

/// Read-through copy of `GET /settings`, fetched at most once between writes.
#[derive(Debug, Default)]
pub struct SettingsCache {
    cached: Option<Value>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, gateway: &Gateway<'_>) -> Result<&Value> {
        if self.cached.is_none() {
            let settings = gateway.get("/settings").context("fetch system settings")?;
            tracing::debug!("settings document cached");
            self.cached = Some(settings);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| anyhow!("settings cache empty after fetch"))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// PATCH the settings document, falling back to the `updateSettings`
    /// mutation with the same payload when the REST write fails.
    pub fn patch(&mut self, gateway: &Gateway<'_>, payload: Value) -> Result<()> {
        let rest = gateway.patch("/settings", payload.clone());
        self.invalidate();
        let Err(rest_err) = rest else {
            return Ok(());
        };
        tracing::warn!(error = %rest_err, "settings PATCH failed, trying GraphQL");
        gateway
            .graphql("updateSettings", UPDATE_SETTINGS, json!({ "settings": payload }))
            .map(|_| ())
            .map_err(|graphql_err| {
                anyhow!("update settings: PATCH failed ({rest_err}); GraphQL failed ({graphql_err})")
            })
    }
}

fn days(value: u32) -> Value {
    Value::String(format!("{value}d"))
}

/// Build the settings PATCH body. Logos and the translation file are not
/// part of it.
pub fn system_settings_payload(settings: &SystemSettings) -> Value {
    let mut payload = Map::new();
    if let Some(general) = &settings.general {
        if let Some(threshold) = general.default_face_threshold {
            payload.insert("defaultFaceThreshold".into(), json!(threshold));
        }
        if let Some(threshold) = general.default_body_threshold {
            payload.insert("defaultBodyThreshold".into(), json!(threshold));
        }
        if let Some(threshold) = general.default_liveness_threshold {
            payload.insert("cameraDefaultLivenessTh".into(), json!(threshold));
        }
        if let Some(hours) = general
            .body_image_retention_period
            .as_ref()
            .and_then(|retention| retention.hours())
        {
            payload.insert("bodyImageTtlH".into(), json!(hours));
        }
    }
    if let Some(seed) = settings.map.as_ref().and_then(|map| map.seed_location) {
        payload.insert("map".into(), json!({ "center": [seed.long, seed.lat] }));
    }
    if let Some(engine) = &settings.engine {
        if let Some(storage) = &engine.video_storage {
            if let Some(value) = storage.all_videos_days {
                payload.insert("videoTtl".into(), days(value));
            }
            if let Some(value) = storage.videos_with_detections_days {
                payload.insert("videosWithoutRecognitionsTtl".into(), days(value));
            }
        }
        if let Some(value) = engine.detection_storage_days {
            payload.insert("detectionTtl".into(), days(value));
        }
        if let Some(value) = engine.alert_storage_days {
            payload.insert("recognitionTtl".into(), days(value));
        }
        if let Some(value) = engine.inquiry_storage_days {
            payload.insert("inquiryTtl".into(), days(value));
        }
    }
    if let Some(name) = settings
        .system_interface
        .as_ref()
        .and_then(|interface| interface.product_name.as_deref())
    {
        payload.insert("whiteLabel".into(), json!({ "productName": name }));
    }
    Value::Object(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoFolder {
    Company,
    Sidebar,
    Favicon,
}

impl LogoFolder {
    pub fn folder(self) -> &'static str {
        match self {
            LogoFolder::Company => "company",
            LogoFolder::Sidebar => "sidebar",
            LogoFolder::Favicon => "favicon",
        }
    }

    /// Field under `whiteLabel` that points at this logo.
    pub fn white_label_field(self) -> &'static str {
        match self {
            LogoFolder::Company => "companyLogo",
            LogoFolder::Sidebar => "sidebarLogo",
            LogoFolder::Favicon => "favicon",
        }
    }
}

/// Prepare a static-files slot and upload the logo bytes into it.
pub fn upload_logo(gateway: &Gateway<'_>, folder: LogoFolder, path: &Path) -> Result<UploadOutcome> {
    let file_name = file_name_of(path);
    let prepared = gateway
        .create(
            "/upload/prepare/static-files",
            json!({
                "staticFilesType": "logos",
                "folders": [{ "folderName": folder.folder(), "fileName": file_name }],
                "shouldOverrideFolders": true,
            }),
        )
        .with_context(|| format!("prepare {} logo upload", folder.folder()))?;
    let handle = prepared_handle(&prepared)
        .ok_or_else(|| anyhow!("prepare {} logo upload: response has no id", folder.folder()))?;
    match gateway.upload_file(&format!("/upload/static-files/{handle}"), "files", path) {
        Ok(_) => {
            tracing::info!(folder = folder.folder(), file = %file_name, "logo uploaded");
            Ok(UploadOutcome::Attached { handle })
        }
        Err(error) => Ok(UploadOutcome::Abandoned {
            handle,
            phase: UploadPhase::Upload,
            error,
        }),
    }
}

/// Point the branding settings at an uploaded logo, keeping every other
/// `whiteLabel` field as the server has it.
pub fn register_logo(
    gateway: &Gateway<'_>,
    cache: &mut SettingsCache,
    folder: LogoFolder,
    file_name: &str,
) -> Result<()> {
    let mut white_label = match cache.get(gateway)?.get("whiteLabel") {
        Some(Value::Object(fields)) => fields.clone(),
        _ => Map::new(),
    };
    white_label.insert(folder.white_label_field().to_string(), json!(file_name));
    cache.patch(gateway, json!({ "whiteLabel": white_label }))
}

pub fn enable_acknowledge_actions(gateway: &Gateway<'_>, enabled: bool) -> Result<()> {
    gateway
        .patch(
            "/acknowledge-actions/action-enforcement",
            json!({ "isEnabled": enabled }),
        )
        .context("set acknowledge action enforcement")?;
    Ok(())
}

/// Create an acknowledge action. Returns `false` when one with the same
/// title already exists.
pub fn create_acknowledge_action(gateway: &Gateway<'_>, title: &str, description: &str) -> Result<bool> {
    let result = gateway
        .create(
            "/acknowledge-actions",
            json!({ "title": title, "description": description }),
        )
        .with_context(|| format!("create acknowledge action {title}"));
    match result {
        Ok(_) => Ok(true),
        Err(err) if is_already_exists(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

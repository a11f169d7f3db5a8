//! Check that what a run recorded in its export is still present on the appliance.
use crate::api::{id_of, Gateway, ListOptions, Transport};
use crate::config::{scalar_text, LoadedConfig};
use crate::ledger::{Category, ExportSnapshot};
use crate::reconcile::{decide, live_entities, Decision, EntityKind, LiveEntity};
use crate::stages::login;
use crate::workflow::branding::SettingsCache;
use crate::workflow::kv::{read_kv, values_match};
use crate::workflow::subjects::primary_count;
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;

/// Numeric settings may be rounded by the appliance.
const NUMERIC_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub category: &'static str,
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checks: Vec<Check>,
}

impl VerifyReport {
    fn pass(&mut self, category: &'static str, name: &str) {
        self.checks.push(Check {
            category,
            name: name.to_string(),
            passed: true,
            detail: String::new(),
        });
    }

    fn fail(&mut self, category: &'static str, name: &str, detail: impl Into<String>) {
        self.checks.push(Check {
            category,
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        });
    }

    fn record(&mut self, category: &'static str, name: &str, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.pass(category, name),
            Err(detail) => self.fail(category, name, detail),
        }
    }

    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|check| check.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.checks.len() - self.passed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|check| !check.passed)
    }

    pub fn log_summary(&self) {
        for check in self.failures() {
            tracing::error!(category = check.category, name = %check.name, "{}", check.detail);
        }
        tracing::info!(
            validated = self.checks.len(),
            passed = self.passed(),
            failed = self.failed(),
            "verification summary"
        );
    }
}

/// Listings fetched once per endpoint.
struct Listings<'g, 'a> {
    gateway: &'g Gateway<'a>,
    cache: BTreeMap<&'static str, Result<Vec<Value>, String>>,
}

impl<'g, 'a> Listings<'g, 'a> {
    fn new(gateway: &'g Gateway<'a>) -> Self {
        Self {
            gateway,
            cache: BTreeMap::new(),
        }
    }

    fn records(&mut self, path: &'static str) -> Result<&[Value], String> {
        let gateway = self.gateway;
        let entry = self.cache.entry(path).or_insert_with(|| {
            let listed = if path == "/subjects" {
                gateway
                    .list_subjects(ListOptions::default())
                    .map(|listing| listing.into_records(path))
            } else {
                gateway.list_all(path)
            };
            listed.map_err(|err| format!("cannot list {path}: {err}"))
        });
        match entry {
            Ok(records) => Ok(records.as_slice()),
            Err(err) => Err(err.clone()),
        }
    }

    /// The live entity with the recorded id, else the one matching `name`.
    fn find(
        &mut self,
        kind: EntityKind,
        path: &'static str,
        item: &Value,
        name: &str,
    ) -> Result<LiveEntity, String> {
        let live = live_entities(kind, self.records(path)?.to_vec());
        if let Some(id) = id_of(item) {
            if let Some(found) = live.iter().find(|entity| entity.id.as_deref() == Some(id.as_str())) {
                return Ok(found.clone());
            }
        }
        match decide(kind, name, &live) {
            Decision::Skip(found) => Ok(found.clone()),
            Decision::Create => Err(format!("{} '{name}' not found", kind.label())),
        }
    }
}

fn text(item: &Value, key: &str) -> String {
    item.get(key).map(scalar_text).unwrap_or_default()
}

/// Log in with the config's credentials and check every recorded item.
pub fn verify_export(
    loaded: &LoadedConfig,
    transport: &dyn Transport,
    snapshot: &ExportSnapshot,
) -> Result<VerifyReport> {
    let configured = loaded.config.onwatch.ip_address.trim();
    if snapshot.metadata.onwatch_ip != configured {
        tracing::warn!(
            export = %snapshot.metadata.onwatch_ip,
            config = configured,
            "export was written for a different appliance"
        );
    }
    let gateway = login(loaded, transport)?;
    let mut report = VerifyReport::default();
    let mut cache = SettingsCache::new();
    let mut listings = Listings::new(&gateway);

    for item in snapshot.items(Category::KvParameters) {
        let key = text(item, "key");
        let expected = match item.get("expected_value") {
            Some(value) => scalar_text(value),
            None => text(item, "value"),
        };
        let outcome = match read_kv(&gateway, &mut cache, &key) {
            Ok(Some(actual)) if values_match(&expected, &actual) => Ok(()),
            Ok(Some(actual)) => Err(format!("expected '{expected}', found '{actual}'")),
            Ok(None) => Err("not readable".to_string()),
            Err(err) => Err(format!("{err:#}")),
        };
        report.record("kv_parameters", &key, outcome);
    }

    for item in snapshot.items(Category::SystemSettings) {
        match cache.get(&gateway) {
            Ok(live) => compare_settings(&mut report, "", item, live),
            Err(err) => report.fail("system_settings", "settings", format!("{err:#}")),
        }
    }

    for item in snapshot.items(Category::Groups) {
        let name = text(item, "name");
        let outcome = if text(item, "type") == "camera_group" {
            listings.find(EntityKind::CameraGroup, "/camera-groups", item, &name)
        } else {
            listings.find(EntityKind::SubjectGroup, "/groups", item, &name)
        };
        report.record("groups", &name, outcome.map(drop));
    }

    for item in snapshot.items(Category::Accounts) {
        let outcome = if text(item, "type") == "user_group" {
            let name = text(item, "name");
            let found = listings.find(EntityKind::UserGroup, "/user-groups", item, &name);
            (name, found)
        } else {
            let username = text(item, "username");
            let found = listings.find(EntityKind::User, "/users", item, &username);
            (username, found)
        };
        report.record("accounts", &outcome.0, outcome.1.map(drop));
    }

    for item in snapshot.items(Category::Subjects) {
        let name = text(item, "name");
        let outcome = listings
            .find(EntityKind::Subject, "/subjects", item, &name)
            .and_then(|subject| check_subject(item, &subject.raw));
        report.record("subjects", &name, outcome);
    }

    for item in snapshot.items(Category::Cameras) {
        let name = text(item, "name");
        let outcome = listings.find(EntityKind::Camera, "/cameras", item, &name);
        report.record("cameras", &name, outcome.map(drop));
    }

    for item in snapshot.items(Category::Inquiries) {
        let name = text(item, "name");
        let outcome = listings.find(EntityKind::InquiryCase, "/inquiry-cases", item, &name);
        report.record("inquiries", &name, outcome.map(drop));
    }

    for item in snapshot.items(Category::MassImport) {
        let name = text(item, "name");
        let outcome = match id_of(item) {
            Some(id) => match gateway.get(&format!("/mass-import/{id}")) {
                Ok(status) => {
                    let state = text(&status, "status");
                    tracing::info!(name = %name, status = %state, "mass import status");
                    if matches!(state.to_lowercase().as_str(), "failed" | "error") {
                        Err(format!("mass import status is {state}"))
                    } else {
                        Ok(())
                    }
                }
                Err(err) => Err(err.to_string()),
            },
            None => Err("recorded without an id".to_string()),
        };
        report.record("mass_import", &name, outcome);
    }

    Ok(report)
}

/// Every recorded image is still there and exactly one of them is primary.
fn check_subject(item: &Value, live: &Value) -> Result<(), String> {
    let images = live
        .get("images")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let recorded = item.get("images").and_then(Value::as_u64).unwrap_or(0) as usize;
    if images.len() < recorded {
        return Err(format!("{} image(s), expected at least {recorded}", images.len()));
    }
    match primary_count(&images) {
        1 => Ok(()),
        primaries => Err(format!("{primaries} primary images")),
    }
}

/// Compare recorded setting leaves with the live document. Leaves the live
/// document does not carry (acknowledge flags, logo records) are not checked.
fn compare_settings(report: &mut VerifyReport, prefix: &str, recorded: &Value, live: &Value) {
    let Value::Object(fields) = recorded else {
        return;
    };
    for (key, expected) in fields {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let Some(actual) = live.get(key) else {
            tracing::debug!(setting = %path, "not present in live settings");
            continue;
        };
        if expected.is_object() {
            compare_settings(report, &path, expected, actual);
            continue;
        }
        let matched = match (expected.as_f64(), actual.as_f64()) {
            (Some(left), Some(right)) => (left - right).abs() <= NUMERIC_TOLERANCE,
            _ => expected == actual || scalar_text(expected) == scalar_text(actual),
        };
        if matched {
            report.pass("system_settings", &path);
        } else {
            report.fail(
                "system_settings",
                &path,
                format!("expected {expected}, found {actual}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RunLedger;
    use crate::stages::tests::{loaded, options, FakeConnector, HEADER};
    use crate::stages::run;
    use crate::testing::FakeOnWatch;
    use serde_json::json;

    #[test]
    fn a_fresh_run_verifies_clean() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOnWatch::new();
        let yaml = format!(
            "{HEADER}kv_parameters:\n  applicationSettings/watchVideo/secondsAfterDetection: 6\nsystem_settings:\n  general:\n    default_face_threshold: 0.72\n  system_interface:\n    product_name: Vision\ngroups:\n  subject_groups:\n    - name: Cardholders\ndevices:\n  - name: Lobby\n    video_url: rtsp://10.9.9.9/lobby\naccounts:\n  users:\n    - username: ops\n      role: Admin\n"
        );
        let loaded = loaded(dir.path(), &yaml);
        let connector = FakeConnector::new(&fake);
        let options = options(dir.path());
        let ledger = run(&loaded, &connector, &options);
        assert!(!ledger.has_failed_steps(), "{:?}", ledger.errors());

        let snapshot = ExportSnapshot::load(&options.export_path).unwrap();
        let report = verify_export(&loaded, &fake, &snapshot).unwrap();
        assert_eq!(report.failed(), 0, "{:?}", report.failures().collect::<Vec<_>>());
        let categories: Vec<_> = report.checks.iter().map(|check| check.category).collect();
        for expected in ["kv_parameters", "system_settings", "groups", "cameras", "accounts"] {
            assert!(categories.contains(&expected), "{expected} not checked");
        }
    }

    #[test]
    fn missing_entities_and_drifted_settings_fail() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOnWatch::new();
        let loaded = loaded(dir.path(), HEADER);
        let mut ledger = RunLedger::new("10.1.1.1", "2.8");
        ledger.add_created_item(
            Category::Cameras,
            json!({ "name": "Gone", "id": "cam-404", "video_url": "rtsp://x" }),
        );
        ledger.add_created_item(Category::SystemSettings, json!({ "defaultFaceThreshold": 0.8 }));
        ledger.add_created_item(
            Category::Subjects,
            json!({ "name": "Ghost", "id": "subject-404", "images": 1 }),
        );

        let report = verify_export(&loaded, &fake, &ledger.snapshot()).unwrap();
        assert_eq!(report.failed(), 3);
        let settings = report
            .failures()
            .find(|check| check.category == "system_settings")
            .unwrap();
        assert_eq!(settings.name, "defaultFaceThreshold");
        assert!(settings.detail.contains("0.6"));
    }

    #[test]
    fn subjects_need_their_images_and_one_primary() {
        let live = json!({ "images": [
            { "url": "a", "isPrimary": true },
            { "url": "b", "isPrimary": true },
        ]});
        assert_eq!(
            check_subject(&json!({ "images": 2 }), &live),
            Err("2 primary images".to_string())
        );
        assert!(check_subject(&json!({ "images": 3 }), &live)
            .unwrap_err()
            .contains("expected at least 3"));
    }
}

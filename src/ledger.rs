//! Run ledger: per-stage outcomes, skips, warnings and the created-item
//! snapshot that the `verify` command replays later.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Partial,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Partial => "partial",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub manual_action: bool,
}

/// Buckets of `created_items` in the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    KvParameters,
    SystemSettings,
    Groups,
    Accounts,
    Subjects,
    Cameras,
    Inquiries,
    MassImport,
    RancherEnvVars,
    TranslationFile,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::KvParameters,
        Category::SystemSettings,
        Category::Groups,
        Category::Accounts,
        Category::Subjects,
        Category::Cameras,
        Category::Inquiries,
        Category::MassImport,
        Category::RancherEnvVars,
        Category::TranslationFile,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Category::KvParameters => "kv_parameters",
            Category::SystemSettings => "system_settings",
            Category::Groups => "groups",
            Category::Accounts => "accounts",
            Category::Subjects => "subjects",
            Category::Cameras => "cameras",
            Category::Inquiries => "inquiries",
            Category::MassImport => "mass_import",
            Category::RancherEnvVars => "rancher_env_vars",
            Category::TranslationFile => "translation_file",
        }
    }

    /// Singletons are merged into one mapping instead of appended.
    pub fn is_singleton(self) -> bool {
        matches!(
            self,
            Category::SystemSettings | Category::MassImport | Category::TranslationFile
        )
    }

    fn empty(self) -> Value {
        if self.is_singleton() {
            Value::Object(Map::new())
        } else {
            Value::Array(Vec::new())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCounts {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub partial: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub onwatch_ip: String,
    pub onwatch_version: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_seconds: Option<f64>,
    pub duration: String,
    pub steps: StepCounts,
    #[serde(default)]
    pub skipped_items: usize,
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub warnings: usize,
}

/// On-disk shape of an exported run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub metadata: ExportMetadata,
    #[serde(default)]
    pub steps: BTreeMap<u8, StepOutcome>,
    #[serde(default)]
    pub created_items: BTreeMap<String, Value>,
}

impl ExportSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read export {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parse export {}", path.display()))
    }

    /// List entries of a category; singletons yield their mapping as one entry.
    pub fn items(&self, category: Category) -> Vec<&Value> {
        match self.created_items.get(category.key()) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(value @ Value::Object(map)) if !map.is_empty() => vec![value],
            _ => Vec::new(),
        }
    }
}

pub struct RunLedger {
    onwatch_ip: String,
    version: String,
    started_at: DateTime<Local>,
    started: Instant,
    finished: Option<(DateTime<Local>, Duration)>,
    steps: BTreeMap<u8, StepOutcome>,
    errors: Vec<String>,
    warnings: Vec<String>,
    skipped: Vec<String>,
    manual_actions: Vec<String>,
    created: BTreeMap<Category, Value>,
}

impl RunLedger {
    pub fn new(onwatch_ip: &str, version: &str) -> Self {
        Self {
            onwatch_ip: onwatch_ip.to_string(),
            version: version.to_string(),
            started_at: Local::now(),
            started: Instant::now(),
            finished: None,
            steps: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            manual_actions: Vec::new(),
            created: Category::ALL
                .iter()
                .map(|category| (*category, category.empty()))
                .collect(),
        }
    }

    pub fn record_step(
        &mut self,
        number: u8,
        name: &str,
        status: StepStatus,
        message: &str,
        manual_action: bool,
    ) {
        if status == StepStatus::Failed {
            self.errors
                .push(format!("Step {number}: {name} - {message}"));
        }
        if manual_action {
            self.manual_actions
                .push(format!("Step {number}: {name} - {message}"));
        }
        self.steps.insert(
            number,
            StepOutcome {
                name: name.to_string(),
                status,
                message: message.to_string(),
                manual_action,
            },
        );
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_skipped(&mut self, kind: &str, name: &str, reason: &str) {
        if reason.is_empty() {
            self.skipped.push(format!("{kind}: {name}"));
        } else {
            self.skipped.push(format!("{kind}: {name} ({reason})"));
        }
    }

    /// Record an entity-level error (not a step failure).
    pub fn add_error(&mut self, kind: &str, name: &str, detail: &str) {
        if detail.is_empty() {
            self.errors.push(format!("{kind}: {name}"));
        } else {
            self.errors.push(format!("{kind}: {name} - {detail}"));
        }
    }

    pub fn add_created_item(&mut self, category: Category, record: Value) {
        let slot = self
            .created
            .entry(category)
            .or_insert_with(|| category.empty());
        if category.is_singleton() {
            match (slot, record) {
                (Value::Object(existing), Value::Object(incoming)) => existing.extend(incoming),
                (slot, record) => *slot = record,
            }
        } else if let Value::Array(items) = slot {
            items.push(record);
        }
    }

    pub fn finish(&mut self) {
        if self.finished.is_none() {
            self.finished = Some((Local::now(), self.started.elapsed()));
        }
    }

    pub fn steps(&self) -> &BTreeMap<u8, StepOutcome> {
        &self.steps
    }

    pub fn step(&self, number: u8) -> Option<&StepOutcome> {
        self.steps.get(&number)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn manual_actions(&self) -> &[String] {
        &self.manual_actions
    }

    /// Recorded items: a list, or an object for singleton categories.
    pub fn created(&self, category: Category) -> &Value {
        static EMPTY_LIST: Value = Value::Array(Vec::new());
        self.created.get(&category).unwrap_or(&EMPTY_LIST)
    }

    pub fn has_failed_steps(&self) -> bool {
        self.steps
            .values()
            .any(|step| step.status == StepStatus::Failed)
    }

    pub fn step_counts(&self) -> StepCounts {
        let mut counts = StepCounts {
            total: self.steps.len(),
            ..StepCounts::default()
        };
        for step in self.steps.values() {
            match step.status {
                StepStatus::Success => counts.success += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Partial => counts.partial += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn snapshot(&self) -> ExportSnapshot {
        let (finished_at, elapsed) = self
            .finished
            .unwrap_or_else(|| (Local::now(), self.started.elapsed()));
        let seconds = elapsed.as_secs_f64();
        ExportSnapshot {
            metadata: ExportMetadata {
                onwatch_ip: self.onwatch_ip.clone(),
                onwatch_version: self.version.clone(),
                started_at: self.started_at.to_rfc3339(),
                finished_at: finished_at.to_rfc3339(),
                duration_seconds: Some(seconds),
                duration: format_duration(Some(seconds)),
                steps: self.step_counts(),
                skipped_items: self.skipped.len(),
                errors: self.errors.len(),
                warnings: self.warnings.len(),
            },
            steps: self.steps.clone(),
            created_items: self
                .created
                .iter()
                .map(|(category, value)| (category.key().to_string(), value.clone()))
                .collect(),
        }
    }

    /// Write the snapshot as YAML, creating parent directories.
    pub fn export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create export dir {}", parent.display()))?;
        }
        let text = serde_yaml::to_string(&self.snapshot()).context("serialize run export")?;
        fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
        tracing::info!(path = %path.display(), "run export written");
        Ok(())
    }

    /// Emit the end-of-run report through the log.
    pub fn log_summary(&self) {
        let counts = self.step_counts();
        for (number, step) in &self.steps {
            tracing::info!(
                step = number,
                status = step.status.as_str(),
                "{}{}",
                step.name,
                if step.message.is_empty() {
                    String::new()
                } else {
                    format!(": {}", step.message)
                }
            );
        }
        tracing::info!(
            total = counts.total,
            success = counts.success,
            failed = counts.failed,
            partial = counts.partial,
            skipped_steps = counts.skipped,
            skipped_items = self.skipped.len(),
            errors = self.errors.len(),
            "run summary"
        );
        for item in &self.skipped {
            tracing::info!("skipped {item}");
        }
        for error in &self.errors {
            tracing::error!("{error}");
        }
        for action in &self.manual_actions {
            tracing::warn!("manual action required: {action}");
        }
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
        if counts.failed > 0 {
            tracing::error!(failed = counts.failed, "run completed with failed steps");
        } else if !self.manual_actions.is_empty() || !self.warnings.is_empty() {
            tracing::warn!("run completed with warnings");
        } else {
            tracing::info!("run completed successfully");
        }
    }
}

/// Human duration: `5.5s`, `2m 5s`, `1h 2m 3s`, or `N/A`.
pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "N/A".to_string();
    };
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    let whole = seconds as u64;
    let (hours, minutes, secs) = (whole / 3600, (whole % 3600) / 60, whole % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else {
        format!("{minutes}m {secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_steps_and_manual_actions_are_aggregated() {
        let mut ledger = RunLedger::new("10.1.1.1", "2.8");
        ledger.record_step(1, "Initialize API Client", StepStatus::Success, "", false);
        ledger.record_step(2, "Set KV Parameters", StepStatus::Failed, "boom", true);
        ledger.record_step(6, "Populate Watch List", StepStatus::Partial, "1 failed", true);
        assert_eq!(ledger.errors(), ["Step 2: Set KV Parameters - boom"]);
        assert_eq!(ledger.manual_actions().len(), 2);
        assert!(ledger.has_failed_steps());
        let counts = ledger.step_counts();
        assert_eq!((counts.total, counts.failed, counts.partial), (3, 1, 1));
    }

    #[test]
    fn skip_and_error_records_are_formatted() {
        let mut ledger = RunLedger::new("10.1.1.1", "2.8");
        ledger.add_skipped("Subject", "Yonatan", "already exists");
        ledger.add_skipped("Camera", "lobby", "");
        ledger.add_error("User", "ops", "HTTP 500");
        assert_eq!(
            ledger.skipped(),
            ["Subject: Yonatan (already exists)", "Camera: lobby"]
        );
        assert_eq!(ledger.errors(), ["User: ops - HTTP 500"]);
    }

    #[test]
    fn fresh_ledger_starts_with_empty_objects_and_lists() {
        let ledger = RunLedger::new("10.1.1.1", "2.8");
        assert_eq!(ledger.created(Category::MassImport), &json!({}));
        assert_eq!(ledger.created(Category::TranslationFile), &json!({}));
        assert_eq!(ledger.created(Category::Cameras), &json!([]));
    }

    #[test]
    fn singleton_categories_merge_instead_of_append() {
        let mut ledger = RunLedger::new("10.1.1.1", "2.8");
        ledger.add_created_item(Category::SystemSettings, json!({ "productName": "X" }));
        ledger.add_created_item(Category::SystemSettings, json!({ "mapCenter": [34.8, 32.0] }));
        ledger.add_created_item(Category::KvParameters, json!({ "key": "a", "value": "1" }));
        ledger.add_created_item(Category::KvParameters, json!({ "key": "b", "value": "2" }));
        assert_eq!(
            ledger.created(Category::SystemSettings),
            &json!({ "productName": "X", "mapCenter": [34.8, 32.0] })
        );
        assert_eq!(ledger.created(Category::KvParameters).as_array().unwrap().len(), 2);
    }

    #[test]
    fn export_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("run.yaml");
        let mut ledger = RunLedger::new("10.1.1.1", "2.6");
        ledger.record_step(1, "Initialize API Client", StepStatus::Success, "", false);
        ledger.add_created_item(
            Category::KvParameters,
            json!({ "key": "applicationSettings/test", "value": "test_value" }),
        );
        ledger.add_created_item(
            Category::RancherEnvVars,
            json!({ "key": "TEST_VAR", "value": "test_value" }),
        );
        ledger.finish();
        ledger.export(&path).unwrap();

        let snapshot = ExportSnapshot::load(&path).unwrap();
        assert_eq!(snapshot.metadata.onwatch_ip, "10.1.1.1");
        assert_eq!(snapshot.metadata.steps.success, 1);
        assert_eq!(snapshot.items(Category::KvParameters).len(), 1);
        assert_eq!(snapshot.items(Category::RancherEnvVars).len(), 1);
        assert!(snapshot.items(Category::MassImport).is_empty());
        assert!(snapshot.created_items.contains_key("translation_file"));
        assert_eq!(snapshot.steps[&1].status, StepStatus::Success);
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(Some(5.5)), "5.5s");
        assert_eq!(format_duration(Some(125.0)), "2m 5s");
        assert_eq!(format_duration(Some(3723.0)), "1h 2m 3s");
        assert_eq!(format_duration(None), "N/A");
    }
}

//! Declarative provisioning config: YAML on disk, typed in memory.
//!
//! Strings pass through `${VAR}`/`$VAR` substitution before typing, and all
//! relative paths resolve against the directory holding the config file.
mod env;
pub mod set_ip;
pub mod validate;

pub use env::substitute_env;
pub use validate::{validate, Severity, ValidationIssue};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_GROUP_NAME: &str = "Default Group";
pub const DEFAULT_CAMERA_GROUP_NAME: &str = "Default Camera Group";
pub const DEFAULT_MASS_IMPORT_GROUP: &str = "Cardholders";
pub const DEFAULT_WORKLOAD_ID: &str = "statefulset:default:cv-engine";
pub const DEFAULT_TRANSLATION_UTIL: &str = "./translation-util";

/// Treat an explicit `null` the same as an absent section.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "null_as_default")]
    pub onwatch: OnWatchConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub kv_parameters: BTreeMap<String, Value>,
    #[serde(deserialize_with = "null_as_default")]
    pub system_settings: SystemSettings,
    #[serde(deserialize_with = "null_as_default")]
    pub groups: GroupsConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub accounts: AccountsConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub watch_list: WatchListConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub devices: Vec<DeviceConfig>,
    #[serde(deserialize_with = "null_as_default")]
    pub inquiries: Vec<InquiryConfig>,
    pub mass_import: Option<MassImportConfig>,
    #[serde(deserialize_with = "null_as_default")]
    pub env_vars: BTreeMap<String, Value>,
    pub ssh: Option<SshConfig>,
    pub rancher: Option<RancherConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OnWatchConfig {
    pub ip_address: String,
    pub username: String,
    pub password: String,
    pub version: String,
    pub base_url: Option<String>,
}

impl OnWatchConfig {
    /// REST root, e.g. `https://10.1.1.1/bt/api`.
    pub fn api_base_url(&self) -> String {
        let root = match self.base_url.as_deref().map(str::trim) {
            Some(base) if !base.is_empty() => base.trim_end_matches('/').to_string(),
            _ => format!("https://{}", self.ip_address.trim()),
        };
        format!("{root}/bt/api")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub general: Option<GeneralSettings>,
    pub map: Option<MapSettings>,
    pub engine: Option<EngineSettings>,
    pub system_interface: Option<SystemInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub default_face_threshold: Option<f64>,
    pub default_body_threshold: Option<f64>,
    pub default_liveness_threshold: Option<f64>,
    pub body_image_retention_period: Option<Hours>,
}

/// Retention given either as a number of hours or text such as "24 hours".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Hours {
    Number(u64),
    Text(String),
}

impl Hours {
    pub fn hours(&self) -> Option<u64> {
        match self {
            Hours::Number(hours) => Some(*hours),
            Hours::Text(text) => Regex::new(r"(\d+)")
                .ok()?
                .captures(text)?
                .get(1)?
                .as_str()
                .parse()
                .ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LatLong {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapSettings {
    pub seed_location: Option<LatLong>,
    pub acknowledge: bool,
    pub action_title: Option<String>,
    pub action_description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoStorage {
    pub all_videos_days: Option<u32>,
    pub videos_with_detections_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub video_storage: Option<VideoStorage>,
    pub detection_storage_days: Option<u32>,
    pub alert_storage_days: Option<u32>,
    pub inquiry_storage_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemInterface {
    pub product_name: Option<String>,
    pub company_logo: Option<PathBuf>,
    pub sidebar_logo: Option<PathBuf>,
    pub favicon: Option<PathBuf>,
    pub translation_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub subject_groups: Vec<SubjectGroupConfig>,
    #[serde(deserialize_with = "null_as_default")]
    pub device_groups: Vec<DeviceGroupConfig>,
    #[serde(deserialize_with = "null_as_default")]
    pub profiles: ProfileIds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubjectGroupConfig {
    pub name: String,
    pub authorization: String,
    pub visibility: String,
    pub priority: i64,
    pub color: String,
    pub description: String,
    #[serde(deserialize_with = "null_as_default")]
    pub camera_groups: Vec<String>,
}

impl Default for SubjectGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            authorization: "Always Unauthorized".to_string(),
            visibility: "Silent".to_string(),
            priority: 0,
            color: "#D20300".to_string(),
            description: String::new(),
            camera_groups: Vec::new(),
        }
    }
}

impl SubjectGroupConfig {
    /// The group the watch-list stage creates on a clean system.
    pub fn default_group() -> Self {
        Self {
            name: DEFAULT_GROUP_NAME.to_string(),
            description: "Default group created automatically".to_string(),
            ..Self::default()
        }
    }

    /// Priority only applies to groups bound to camera groups.
    pub fn effective_priority(&self) -> i64 {
        if self.camera_groups.is_empty() {
            0
        } else {
            self.priority
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceGroupConfig {
    pub name: String,
    pub description: String,
}

/// Deployment-specific profile identifiers keyed by display value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileIds {
    pub visibility: BTreeMap<String, String>,
    pub alert_levels: BTreeMap<String, String>,
}

const FALLBACK_VISIBILITY: &[(&str, &str)] = &[
    ("silent", "2ccc39f1-1d9e-4cbd-a3d5-3a6b0f8a0001"),
    ("visible", "2ccc39f1-1d9e-4cbd-a3d5-3a6b0f8a0002"),
    ("loud", "2ccc39f1-1d9e-4cbd-a3d5-3a6b0f8a0003"),
];

const FALLBACK_ALERT_LEVELS: &[(&str, &str)] = &[
    ("always authorized", "7f1e0c52-5a0b-4c8e-9e51-4b0d7c1a0001"),
    ("always unauthorized", "7f1e0c52-5a0b-4c8e-9e51-4b0d7c1a0002"),
];

fn lookup_profile(
    configured: &BTreeMap<String, String>,
    fallback: &[(&str, &str)],
    name: &str,
) -> Option<String> {
    let wanted = name.trim().to_lowercase();
    configured
        .iter()
        .find(|(key, _)| key.trim().to_lowercase() == wanted)
        .map(|(_, id)| id.clone())
        .or_else(|| {
            fallback
                .iter()
                .find(|(key, _)| *key == wanted)
                .map(|(_, id)| id.to_string())
        })
}

impl ProfileIds {
    pub fn visibility_id(&self, visibility: &str) -> Option<String> {
        lookup_profile(&self.visibility, FALLBACK_VISIBILITY, visibility)
    }

    pub fn alert_level_id(&self, authorization: &str) -> Option<String> {
        lookup_profile(&self.alert_levels, FALLBACK_ALERT_LEVELS, authorization)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub users: Vec<UserConfig>,
    #[serde(deserialize_with = "null_as_default")]
    pub user_groups: Vec<UserGroupConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub role: String,
    pub user_group: String,
    /// Absent: generate one. Empty: leave the password unset.
    pub password: Option<String>,
}

impl UserConfig {
    /// Password to send, or `None` when the field must be omitted.
    pub fn effective_password(&self) -> Option<String> {
        match self.password.as_deref() {
            Some("") => None,
            Some(password) => Some(password.to_string()),
            None => Some(generated_password(self.username.trim())),
        }
    }
}

/// `Capitalized` first letter, the rest lower-case, then `123!`.
pub fn generated_password(username: &str) -> String {
    let mut chars = username.chars();
    match chars.next() {
        Some(first) => format!(
            "{}{}123!",
            first.to_uppercase(),
            chars.as_str().to_lowercase()
        ),
        None => "123!".to_string(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserGroupConfig {
    pub title: Option<String>,
    pub name: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub subject_groups: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub camera_groups: Vec<String>,
}

impl UserGroupConfig {
    pub fn display_name(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .or(self.name.as_deref())
            .unwrap_or_default()
            .trim()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchListConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub subjects: Vec<SubjectConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub images: Vec<ImageRef>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Path(PathBuf),
    Entry { path: PathBuf },
}

impl ImageRef {
    pub fn path(&self) -> &Path {
        match self {
            ImageRef::Path(path) | ImageRef::Entry { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub video_url: String,
    pub camera_group: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub details: DeviceDetails,
    #[serde(deserialize_with = "null_as_default")]
    pub calibration: CalibrationConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub security_access: SecurityAccessConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceDetails {
    pub threshold: Option<f64>,
    pub location: Option<LocationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Padding {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_face_width: Option<u32>,
    pub max_face_width: Option<u32>,
    pub frame_skip: Option<u32>,
    pub tracker_timeout_ms: Option<u32>,
    pub tracker_max_age_ms: Option<u32>,
    pub padding: Option<Padding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityAccessConfig {
    pub liveness_threshold: Option<f64>,
    pub access_control: Option<bool>,
    pub privacy_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InquiryConfig {
    pub name: String,
    pub priority: Option<Priority>,
    #[serde(deserialize_with = "null_as_default")]
    pub files: Vec<InquiryFileConfig>,
}

/// Inquiry priority as a level name or a raw numeric value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Priority {
    Number(f64),
    Level(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InquiryFileConfig {
    pub path: PathBuf,
    /// `default` or `custom`; custom files get a region-of-interest pass.
    pub settings: Option<String>,
    pub threshold: Option<f64>,
    pub padding: Option<Padding>,
}

impl InquiryFileConfig {
    pub fn is_custom(&self) -> bool {
        self.settings
            .as_deref()
            .is_some_and(|settings| settings.trim().eq_ignore_ascii_case("custom"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MassImportConfig {
    pub name: Option<String>,
    pub file_path: PathBuf,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub ip_address: String,
    pub username: String,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub key_path: Option<PathBuf>,
    pub translation_util_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RancherConfig {
    pub ip_address: String,
    pub port: Option<Value>,
    pub username: String,
    pub password: String,
    pub base_url: Option<String>,
    pub workload_path: Option<String>,
    pub project_id: Option<String>,
}

impl RancherConfig {
    /// Port as a number, accepting numeric strings left by env substitution.
    pub fn port(&self) -> Result<Option<u16>> {
        let Some(raw) = &self.port else {
            return Ok(None);
        };
        let parsed = match raw {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        };
        match parsed.and_then(|port| u16::try_from(port).ok()) {
            Some(port) if port >= 1 => Ok(Some(port)),
            _ => Err(anyhow!("invalid port number: {raw} (must be 1-65535)")),
        }
    }

    pub fn api_base_url(&self) -> Result<String> {
        if let Some(base) = self.base_url.as_deref().map(str::trim) {
            if !base.is_empty() {
                return Ok(base.trim_end_matches('/').to_string());
            }
        }
        let port = self.port()?.unwrap_or(443);
        Ok(format!("https://{}:{port}", self.ip_address.trim()))
    }
}

/// A parsed config plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        crate::util::resolve_path(&self.base_dir, path)
    }
}

/// Read, substitute and type a config file.
pub fn load(path: &Path) -> Result<LoadedConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config = parse(&text, &|name| std::env::var(name).ok())
        .with_context(|| format!("parse config {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        base_dir,
    })
}

/// Parse config text with an explicit variable lookup.
pub fn parse(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Config> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(text).context("parse YAML")?;
    if doc.is_null() {
        return Ok(Config::default());
    }
    substitute_env(&mut doc, lookup);
    serde_yaml::from_value(doc).context("decode config sections")
}

/// Render a scalar config value the way the appliance expects it.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
onwatch:
  ip_address: "10.1.1.1"
  username: admin
  password: ${ONWATCH_PASSWORD}
  version: "2.8"
kv_parameters:
  "applicationSettings/watchVideo/secondsAfterDetection": 6
groups:
  subject_groups:
    - name: Cardholders
      authorization: Always Authorized
      visibility: Visible
      priority: 2
accounts:
  users:
    - username: operator
      role: Operator
      user_group: Operators
watch_list:
  subjects:
    - name: Yonatan
      images:
        - path: assets/images/me.jpg
        - assets/images/me2.jpg
inquiries:
  - name: Case A
    priority: High
    files:
      - path: assets/videos/Neo.webm
        settings: custom
  - name: Case B
    priority: 250
rancher:
  ip_address: "10.1.1.1"
  port: "9443"
  username: admin
  password: pw
env_vars:
  ENABLE_DVR: true
devices:
"#;

    fn lookup(name: &str) -> Option<String> {
        (name == "ONWATCH_PASSWORD").then(|| "s3cret".to_string())
    }

    #[test]
    fn parses_sections_and_substitutes_env() {
        let config = parse(SAMPLE, &lookup).unwrap();
        assert_eq!(config.onwatch.password, "s3cret");
        assert_eq!(config.onwatch.api_base_url(), "https://10.1.1.1/bt/api");
        assert_eq!(
            scalar_text(&config.kv_parameters["applicationSettings/watchVideo/secondsAfterDetection"]),
            "6"
        );
        assert_eq!(config.groups.subject_groups[0].color, "#D20300");
        assert_eq!(config.groups.subject_groups[0].effective_priority(), 0);
        assert!(config.devices.is_empty());
        let images = &config.watch_list.subjects[0].images;
        assert_eq!(images[0].path(), Path::new("assets/images/me.jpg"));
        assert_eq!(images[1].path(), Path::new("assets/images/me2.jpg"));
        assert!(config.inquiries[0].files[0].is_custom());
        assert_eq!(config.inquiries[0].priority, Some(Priority::Level("High".into())));
        assert_eq!(config.inquiries[1].priority, Some(Priority::Number(250.0)));
        assert_eq!(scalar_text(&config.env_vars["ENABLE_DVR"]), "true");
    }

    #[test]
    fn rancher_port_accepts_numeric_strings() {
        let config = parse(SAMPLE, &lookup).unwrap();
        let rancher = config.rancher.unwrap();
        assert_eq!(rancher.port().unwrap(), Some(9443));
        assert_eq!(rancher.api_base_url().unwrap(), "https://10.1.1.1:9443");

        let bad = RancherConfig {
            port: Some(Value::from(70000)),
            ..RancherConfig::default()
        };
        assert!(bad.port().is_err());
    }

    #[test]
    fn passwords_follow_generation_rules() {
        assert_eq!(generated_password("oPERATOR"), "Operator123!");
        assert_eq!(generated_password("test"), "Test123!");
        let mut user = UserConfig {
            username: "admin2".to_string(),
            ..UserConfig::default()
        };
        assert_eq!(user.effective_password().as_deref(), Some("Admin2123!"));
        user.password = Some(String::new());
        assert_eq!(user.effective_password(), None);
        user.password = Some("Given1!".to_string());
        assert_eq!(user.effective_password().as_deref(), Some("Given1!"));
    }

    #[test]
    fn profile_ids_prefer_configured_values() {
        let mut profiles = ProfileIds::default();
        assert!(profiles.visibility_id("Silent").is_some());
        assert_eq!(profiles.visibility_id("unknown"), None);
        profiles
            .visibility
            .insert("Silent".to_string(), "custom-id".to_string());
        assert_eq!(profiles.visibility_id("silent").as_deref(), Some("custom-id"));
        assert!(profiles.alert_level_id("Always Authorized").is_some());
    }

    #[test]
    fn retention_hours_accept_text() {
        assert_eq!(Hours::Number(12).hours(), Some(12));
        assert_eq!(Hours::Text("24 hours".into()).hours(), Some(24));
        assert_eq!(Hours::Text("forever".into()).hours(), None);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse("", &lookup).unwrap();
        assert!(config.onwatch.ip_address.is_empty());
        assert!(config.mass_import.is_none());
    }
}

//! Key-value application settings: write through GraphQL, read back to
//! confirm.
//!
//! `DEFAULT/` keys live in a flat KV table exposed over REST. Every other
//! key is a `/`-separated path into the settings document.
use super::branding::SettingsCache;
use crate::api::Gateway;
use crate::poll::{poll_until, Backoff};
use anyhow::{Context, Result};
use serde_json::{json, Value};

const UPDATE_SINGLE_SETTING: &str = "mutation updateSingleSetting($settingInput: KeyValueSettingInput!) {\n  updateSingleSetting(settingInput: $settingInput) {\n    code\n  }\n}\n";
const GET_SINGLE_SETTING: &str = "query getSingleSetting($key: String!) {\n  getSingleSetting(key: $key) {\n    key\n    value\n  }\n}\n";

const DEFAULT_PREFIX: &str = "DEFAULT/";

/// Result of writing one KV setting.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOutcome {
    /// Read back with the expected value.
    Verified(String),
    /// Written, but the read-back never matched; carries the last value seen.
    Unverified(Option<String>),
}

pub fn set_kv(gateway: &Gateway<'_>, cache: &mut SettingsCache, key: &str, value: &str) -> Result<()> {
    let result = gateway
        .graphql(
            "updateSingleSetting",
            UPDATE_SINGLE_SETTING,
            json!({ "settingInput": { "key": key, "value": value } }),
        )
        .with_context(|| format!("set KV parameter {key}"));
    cache.invalidate();
    result.map(|_| ())
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn find_in_table(records: &Value, key: &str) -> Option<String> {
    let records = match records {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => records
            .get("items")
            .or_else(|| records.get("data"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };
    records
        .iter()
        .find(|record| record.get("key").and_then(Value::as_str) == Some(key))
        .and_then(|record| record.get("value"))
        .and_then(text_of)
}

fn lookup_path(settings: &Value, key: &str) -> Option<String> {
    key.split('/')
        .try_fold(settings, |node, segment| node.get(segment))
        .and_then(text_of)
}

/// Current value of a KV setting, or `None` when no source knows it.
pub fn read_kv(gateway: &Gateway<'_>, cache: &mut SettingsCache, key: &str) -> Result<Option<String>> {
    if key.starts_with(DEFAULT_PREFIX) {
        for endpoint in gateway.version().kv_endpoints() {
            match gateway.get(endpoint) {
                Ok(table) => {
                    if let Some(value) = find_in_table(&table, key) {
                        return Ok(Some(value));
                    }
                }
                Err(err) => tracing::debug!(endpoint, error = %err, "KV endpoint unavailable"),
            }
        }
    } else {
        match cache.get(gateway) {
            Ok(settings) => {
                if let Some(value) = lookup_path(settings, key) {
                    return Ok(Some(value));
                }
            }
            Err(err) => tracing::debug!(key, error = %format!("{err:#}"), "settings lookup failed"),
        }
    }
    let data = gateway
        .graphql("getSingleSetting", GET_SINGLE_SETTING, json!({ "key": key }))
        .with_context(|| format!("read KV parameter {key}"))?;
    Ok(data
        .get("getSingleSetting")
        .and_then(|setting| setting.get("value"))
        .and_then(text_of))
}

/// Values compare as text, or numerically when both sides parse as numbers
/// ("6" == "6.0").
pub fn values_match(expected: &str, actual: &str) -> bool {
    let (expected, actual) = (expected.trim(), actual.trim());
    if expected == actual {
        return true;
    }
    match (expected.parse::<f64>(), actual.parse::<f64>()) {
        (Ok(left), Ok(right)) => (left - right).abs() < f64::EPSILON,
        _ => expected.eq_ignore_ascii_case(actual)
            && matches!(expected.to_ascii_lowercase().as_str(), "true" | "false"),
    }
}

/// Write a setting, then poll until reading it back returns the same value.
pub fn apply_kv(
    gateway: &Gateway<'_>,
    cache: &mut SettingsCache,
    key: &str,
    value: &str,
    backoff: &Backoff,
) -> Result<KvOutcome> {
    set_kv(gateway, cache, key, value)?;
    let mut last_seen = None;
    let verified = poll_until(&format!("KV parameter {key}"), backoff, || {
        let current = read_kv(gateway, cache, key)?;
        let matched = current
            .as_deref()
            .is_some_and(|current| values_match(value, current));
        if !matched {
            // Next attempt must see a fresh settings document.
            cache.invalidate();
        }
        last_seen = current.clone();
        Ok(matched.then_some(current).flatten())
    });
    match verified {
        Ok(current) => {
            tracing::info!(key, value = %current, "KV parameter verified");
            Ok(KvOutcome::Verified(current))
        }
        Err(err) => {
            tracing::warn!(key, expected = value, actual = ?last_seen, error = %err, "KV parameter not verified");
            Ok(KvOutcome::Unverified(last_seen))
        }
    }
}

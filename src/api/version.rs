//! Supported appliance versions and the endpoint families that differ between them.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformVersion {
    #[serde(rename = "2.6")]
    V2_6,
    #[serde(rename = "2.8")]
    V2_8,
}

/// How subjects are listed on a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectListing {
    /// `GET /subjects?offset=..&limit=..`
    Query,
    /// `POST /subjects/search` with `{offset, limit}`
    Search,
}

pub const SUPPORTED_VERSIONS: &[&str] = &["2.6", "2.8"];

impl PlatformVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformVersion::V2_6 => "2.6",
            PlatformVersion::V2_8 => "2.8",
        }
    }

    pub fn subject_listing(self) -> SubjectListing {
        match self {
            PlatformVersion::V2_6 => SubjectListing::Query,
            PlatformVersion::V2_8 => SubjectListing::Search,
        }
    }

    /// REST endpoints to try, in order, when reading a `DEFAULT/` KV setting.
    pub fn kv_endpoints(self) -> &'static [&'static str] {
        match self {
            PlatformVersion::V2_6 => &[
                "/settings/kv",
                "/key-value-settings",
                "/kv-parameters",
                "/settings/key-value",
            ],
            PlatformVersion::V2_8 => &[
                "/settings/kv",
                "/key-value-settings",
                "/settings/key-value",
                "/kv-parameters",
            ],
        }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_version(s).ok_or_else(|| {
            anyhow::anyhow!(
                "unsupported OnWatch version {s:?} (supported: {})",
                SUPPORTED_VERSIONS.join(", ")
            )
        })
    }
}

/// Extract `major.minor` from strings such as "2.8", "v2.6" or "2.8.1-rc2".
pub fn parse_version(text: &str) -> Option<PlatformVersion> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(\d+)\.(\d+)").ok())
        .as_ref()?;
    let captures = pattern.captures(text)?;
    match (captures.get(1)?.as_str(), captures.get(2)?.as_str()) {
        ("2", "6") => Some(PlatformVersion::V2_6),
        ("2", "8") => Some(PlatformVersion::V2_8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_versions_from_loose_strings() {
        assert_eq!(parse_version("2.6"), Some(PlatformVersion::V2_6));
        assert_eq!(parse_version("v2.8.1"), Some(PlatformVersion::V2_8));
        assert_eq!(parse_version("OnWatch 2.8-rc2"), Some(PlatformVersion::V2_8));
        assert_eq!(parse_version("2.7"), None);
        assert_eq!(parse_version("latest"), None);
    }

    #[test]
    fn from_str_reports_supported_versions() {
        let err = "3.0".parse::<PlatformVersion>().unwrap_err();
        assert!(err.to_string().contains("2.6, 2.8"));
        assert_eq!("2.8".parse::<PlatformVersion>().unwrap(), PlatformVersion::V2_8);
    }

    #[test]
    fn version_selects_listing_family_and_kv_order() {
        assert_eq!(PlatformVersion::V2_6.subject_listing(), SubjectListing::Query);
        assert_eq!(PlatformVersion::V2_8.subject_listing(), SubjectListing::Search);
        assert_eq!(PlatformVersion::V2_6.kv_endpoints()[2], "/kv-parameters");
        assert_eq!(PlatformVersion::V2_8.kv_endpoints()[2], "/settings/key-value");
    }
}

//! Duplicate reconciliation between declared entities and live listings.
//!
//! Groups tolerate singular/plural drift ("Cardholders" vs "Cardholder");
//! every other kind is a unique identifier compared case-insensitively.
use crate::api::id_of;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Subject,
    SubjectGroup,
    CameraGroup,
    Camera,
    User,
    UserGroup,
    InquiryCase,
    KvSetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Plural,
}

impl EntityKind {
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Subject => "Subject",
            EntityKind::SubjectGroup => "Subject Group",
            EntityKind::CameraGroup => "Camera Group",
            EntityKind::Camera => "Camera",
            EntityKind::User => "User",
            EntityKind::UserGroup => "User Group",
            EntityKind::InquiryCase => "Inquiry Case",
            EntityKind::KvSetting => "KV Parameter",
        }
    }

    pub fn match_rule(self) -> MatchRule {
        match self {
            EntityKind::SubjectGroup | EntityKind::CameraGroup => MatchRule::Plural,
            _ => MatchRule::Exact,
        }
    }

    /// Record fields that carry the entity's display name, in priority order.
    pub fn name_keys(self) -> &'static [&'static str] {
        match self {
            EntityKind::Subject | EntityKind::InquiryCase | EntityKind::KvSetting => {
                &["name", "key", "title"]
            }
            EntityKind::User => &["username"],
            _ => &["title", "name"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A record already present on the appliance.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntity {
    pub id: Option<String>,
    pub name: String,
    pub raw: Value,
}

/// Project raw listing records onto named live entities, dropping unnamed ones.
pub fn live_entities(kind: EntityKind, records: Vec<Value>) -> Vec<LiveEntity> {
    records
        .into_iter()
        .filter_map(|raw| {
            let name = kind.name_keys().iter().find_map(|key| {
                raw.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
            })?;
            Some(LiveEntity {
                id: id_of(&raw),
                name,
                raw,
            })
        })
        .collect()
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn names_match(declared: &str, live: &str, rule: MatchRule) -> bool {
    let a = normalize(declared);
    let b = normalize(live);
    if a == b {
        return true;
    }
    match rule {
        MatchRule::Exact => false,
        MatchRule::Plural => {
            format!("{a}s") == b
                || format!("{b}s") == a
                || format!("{a}es") == b
                || format!("{b}es") == a
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision<'a> {
    Skip(&'a LiveEntity),
    Create,
}

/// Decide whether a declared entity already exists. Exact matches win over
/// plural variants.
pub fn decide<'a>(kind: EntityKind, declared: &str, live: &'a [LiveEntity]) -> Decision<'a> {
    if let Some(existing) = live
        .iter()
        .find(|entity| names_match(declared, &entity.name, MatchRule::Exact))
    {
        return Decision::Skip(existing);
    }
    if kind.match_rule() == MatchRule::Plural {
        if let Some(existing) = live
            .iter()
            .find(|entity| names_match(declared, &entity.name, MatchRule::Plural))
        {
            return Decision::Skip(existing);
        }
    }
    Decision::Create
}

/// Id of the live entity matching `declared`, if any.
pub fn resolve_id(kind: EntityKind, declared: &str, live: &[LiveEntity]) -> Option<String> {
    match decide(kind, declared, live) {
        Decision::Skip(entity) => entity.id.clone(),
        Decision::Create => None,
    }
}

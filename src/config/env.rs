use regex::{Captures, Regex};
use serde_yaml::Value;
use std::sync::OnceLock;

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}|\$([A-Z_][A-Z0-9_]*)").ok())
        .as_ref()
}

/// Replace `${VAR}` and `$VAR` in every string scalar. Unknown variables are
/// left as written so validation can point at them.
pub fn substitute_env(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(text) => {
            if let Some(replaced) = substitute_str(text, lookup) {
                *text = replaced;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_env(item, lookup);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item, lookup);
            }
        }
        Value::Tagged(tagged) => substitute_env(&mut tagged.value, lookup),
        _ => {}
    }
}

fn substitute_str(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let pattern = pattern()?;
    if !text.contains('$') {
        return None;
    }
    let replaced = pattern.replace_all(text, |caps: &Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        lookup(name).unwrap_or_else(|| caps[0].to_string())
    });
    Some(replaced.into_owned())
}

/// True when a value still carries an unresolved placeholder.
pub fn has_placeholder(text: &str) -> bool {
    pattern().is_some_and(|pattern| pattern.is_match(text))
}

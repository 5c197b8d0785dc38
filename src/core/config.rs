use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

// ---------------------------------------------------------------------------
// SettingsProvider — dotted-key settings with file + env-var resolution
// ---------------------------------------------------------------------------

/// Key-value settings with dotted keys (`search.iterations`,
/// `rate_limiting.profile`, `search.engine.web.brave.api_key`, …).
///
/// Lookups never fail: unknown keys return `None` and the typed helpers fall
/// back to the caller's default. The provider is injected everywhere — there
/// is no process-wide singleton.
pub trait SettingsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => {
                !matches!(s.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
            }
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            _ => default,
        }
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_u64(key, default as u64) as usize
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => default.to_string(),
        }
    }

    fn get_string_opt(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }
}

/// File-based settings (`delver.json`) with env-var fallback for every key.
///
/// Search order (first found wins):
/// 1. `DELVER_CONFIG` env var path
/// 2. `./delver.json` (process cwd)
/// 3. `../delver.json` (one level up)
///
/// Missing file → empty settings (env fallbacks still apply).
/// Parse error → log a warning, same as missing.
///
/// Env fallback: a lookup of `search.snippets_only` also consults
/// `DELVER_SEARCH__SNIPPETS_ONLY` (dots become double underscores).
pub struct FileSettings {
    values: HashMap<String, Value>,
}

impl FileSettings {
    pub fn load() -> Self {
        let mut candidates: Vec<PathBuf> = vec![
            PathBuf::from("delver.json"),
            PathBuf::from("../delver.json"),
        ];
        if let Ok(env_path) = std::env::var("DELVER_CONFIG") {
            candidates.insert(0, PathBuf::from(env_path));
        }

        for path in &candidates {
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            match serde_json::from_str::<Value>(&contents) {
                Ok(doc) => {
                    let mut values = HashMap::new();
                    flatten_into("", &doc, &mut values);
                    tracing::info!("delver.json loaded from {}", path.display());
                    return Self { values };
                }
                Err(e) => {
                    warn!(
                        "delver.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return Self::empty();
                }
            }
        }

        Self::empty()
    }

    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    fn env_override(key: &str) -> Option<Value> {
        let env_key = format!("DELVER_{}", key.to_ascii_uppercase().replace('.', "__"));
        let raw = std::env::var(env_key).ok()?;
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        // Interpret env values as JSON when possible so numbers and booleans
        // come through typed; fall back to a plain string.
        Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
    }
}

impl SettingsProvider for FileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = Self::env_override(key) {
            return Some(v);
        }
        self.values.get(key).cloned()
    }
}

/// In-memory settings for tests and embedding callers.
#[derive(Default)]
pub struct StaticSettings {
    values: HashMap<String, Value>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SettingsProvider for StaticSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut HashMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(&key, v, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_objects_flatten_to_dotted_keys() {
        let doc: Value = serde_json::json!({
            "search": { "snippets_only": false, "engine": { "brave": { "api_key": "k" } } },
            "rate_limiting": { "profile": "balanced" }
        });
        let mut values = HashMap::new();
        flatten_into("", &doc, &mut values);
        let s = StaticSettings { values };
        assert!(!s.get_bool("search.snippets_only", true));
        assert_eq!(
            s.get_string("search.engine.brave.api_key", ""),
            "k".to_string()
        );
        assert_eq!(s.get_string("rate_limiting.profile", "x"), "balanced");
    }

    #[test]
    fn unknown_keys_fall_back_to_defaults() {
        let s = StaticSettings::new();
        assert_eq!(s.get_u64("search.iterations", 2), 2);
        assert!(s.get_bool("rate_limiting.enabled", true));
        assert_eq!(s.get_string_opt("llm.api_key"), None);
    }

    #[test]
    fn stringly_booleans_and_numbers_coerce() {
        let s = StaticSettings::new()
            .set("a", "false")
            .set("b", "3")
            .set("c", 0.25);
        assert!(!s.get_bool("a", true));
        assert_eq!(s.get_u64("b", 0), 3);
        assert!((s.get_f64("c", 0.0) - 0.25).abs() < f64::EPSILON);
    }
}

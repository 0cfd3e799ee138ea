//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HaulSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HAUL_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Objects merge recursively, arrays and primitives are replaced, and `null`
//! in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::HaulSettings;

/// `~/.haul`, the home of the settings file and relative data paths.
pub fn haul_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".haul")
}

/// Default settings file path (`~/.haul/settings.json`).
pub fn settings_path() -> PathBuf {
    haul_home().join("settings.json")
}

/// Resolve a configured path: absolute paths are kept, relative ones land
/// under [`haul_home`].
pub fn resolve_data_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        haul_home().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HaulSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HaulSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<HaulSettings> {
    let defaults = serde_json::to_value(HaulSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values. `source` wins.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HAUL_*` environment variable overrides.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut HaulSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`, so callers can supply a map
/// instead of the process environment.
pub fn apply_overrides_from<F>(settings: &mut HaulSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("HAUL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("HAUL_PORT", 0, 65535) {
        settings.server.port = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = env.u64("HAUL_RECONNECT_GRACE_SECS", 0, 86_400) {
        settings.sessions.reconnect_grace_secs = v;
    }

    // ── Jobs ────────────────────────────────────────────────────────
    if let Some(v) = env.usize("HAUL_MAX_JOBS", 1, 1024) {
        settings.jobs.max_concurrent_jobs = v;
    }
    if let Some(v) = env.u64("HAUL_VALIDATION_TIMEOUT_MS", 100, 600_000) {
        settings.jobs.validation_timeout_ms = v;
    }

    // ── Artifacts ───────────────────────────────────────────────────
    if let Some(v) = env.string("HAUL_DOWNLOADS_DIR") {
        settings.artifacts.downloads_dir = v;
    }
    if let Some(v) = env.u64("HAUL_ARTIFACT_TTL_SECS", 1, 604_800) {
        settings.artifacts.ttl_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("HAUL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("HAUL_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::errors::SettingsError;

    fn overrides(pairs: &[(&str, &str)]) -> HaulSettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = HaulSettings::default();
        apply_overrides_from(&mut settings, |name| map.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = json!({"server": {"port": 5000, "host": "127.0.0.1"}});
        let source = json!({"server": {"port": 8000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 8000);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(json!({"items": [1, 2, 3]}), json!({"items": [4]}));
        assert_eq!(merged["items"], json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = read_file_layer(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.sessions.reconnect_grace_secs, 300);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"jobs": {"maxConcurrentJobs": 2}, "artifacts": {"ttlSecs": 30}}"#,
        )
        .unwrap();

        let settings = read_file_layer(&path).unwrap();
        assert_eq!(settings.jobs.max_concurrent_jobs, 2);
        assert_eq!(settings.artifacts.ttl_secs, 30);
        assert_eq!(settings.jobs.validation_timeout_ms, 10_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert_matches!(load_settings_from_path(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn invalid_value_is_rejected_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"jobs": {"maxConcurrentJobs": 0}}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        );
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("HAUL_HOST", "0.0.0.0"),
            ("HAUL_PORT", "8080"),
            ("HAUL_MAX_JOBS", "3"),
            ("HAUL_RECONNECT_GRACE_SECS", "0"),
            ("HAUL_DOWNLOADS_DIR", "/srv/haul"),
            ("HAUL_ARTIFACT_TTL_SECS", "60"),
            ("HAUL_LOG_LEVEL", "debug"),
            ("HAUL_LOG_JSON", "yes"),
        ]);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.jobs.max_concurrent_jobs, 3);
        assert_eq!(s.sessions.reconnect_grace_secs, 0);
        assert_eq!(s.artifacts.downloads_dir, "/srv/haul");
        assert_eq!(s.artifacts.ttl_secs, 60);
        assert_eq!(s.logging.level, "debug");
        assert!(s.logging.json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let s = overrides(&[
            ("HAUL_PORT", "99999"),
            ("HAUL_MAX_JOBS", "0"),
            ("HAUL_LOG_JSON", "maybe"),
            ("HAUL_HOST", ""),
        ]);
        assert_eq!(s.server.port, 5000);
        assert_eq!(s.jobs.max_concurrent_jobs, 8);
        assert!(!s.logging.json);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "{val}");
        }
        for val in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(val), Some(false), "{val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u64_range("5", 10, 20), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
    }

    #[test]
    fn relative_data_paths_resolve_under_home() {
        assert!(resolve_data_path("downloads").ends_with(".haul/downloads"));
        assert_eq!(resolve_data_path("/var/tmp/x"), PathBuf::from("/var/tmp/x"));
    }
}

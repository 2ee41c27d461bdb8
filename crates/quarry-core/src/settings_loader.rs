//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON document (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `QUARRY_DEBUG` | `debug` |
//! | `QUARRY_LOG_LEVEL` | `log_level` |
//! | `QUARRY_DATABASE_ENGINE` | `databases.default.engine` |
//! | `QUARRY_DATABASE_NAME` | `databases.default.name` |
//! | `QUARRY_EXPLICIT_SAVE` | `query.explicit_save` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use quarry_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("quarry.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::QuarryError;
use crate::settings::{DatabaseSettings, Settings};

/// Loads settings from a TOML string.
///
/// Keys missing from the document keep their default values, including keys
/// nested inside tables.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or cannot be deserialized.
pub fn from_toml_str(toml_str: &str) -> Result<Settings, QuarryError> {
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| QuarryError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;

    merged_with_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, QuarryError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        QuarryError::ConfigurationError(format!(
            "Failed to read TOML file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, QuarryError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string.
///
/// # Errors
///
/// Returns an error if the JSON is malformed or cannot be deserialized.
pub fn from_json_str(json_str: &str) -> Result<Settings, QuarryError> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| QuarryError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;

    merged_with_defaults(json_value, "JSON")
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `QUARRY_*` environment variable overrides to a settings struct.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Applies overrides read through `lookup`, which maps an environment
/// variable name to its value.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("QUARRY_DEBUG") {
        settings.debug = is_truthy(&val);
    }

    if let Some(val) = lookup("QUARRY_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Some(val) = lookup("QUARRY_EXPLICIT_SAVE") {
        settings.query.explicit_save = is_truthy(&val);
    }

    let engine = lookup("QUARRY_DATABASE_ENGINE");
    let name = lookup("QUARRY_DATABASE_NAME");
    if engine.is_some() || name.is_some() {
        let db = settings
            .databases
            .entry("default".to_string())
            .or_insert_with(DatabaseSettings::default);
        if let Some(engine) = engine {
            db.engine = engine;
        }
        if let Some(name) = name {
            db.name = name;
        }
    }
}

// ============================================================
// Helpers
// ============================================================

fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn merged_with_defaults(
    value: serde_json::Value,
    format: &str,
) -> Result<Settings, QuarryError> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        QuarryError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        QuarryError::ConfigurationError(format!("Failed to deserialize settings from {format}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = if let Some(base_v) = base_map.remove(&key) {
                    merge_json(base_v, override_v)
                } else {
                    override_v
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    // ── TOML loading ────────────────────────────────────────────────

    #[test]
    fn test_from_toml_str_basic() {
        let toml = r#"
            debug = false
            log_level = "warn"
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.log_level, "warn");
        // Defaults preserved
        assert_eq!(settings.default_database().unwrap().engine, "sqlite");
    }

    #[test]
    fn test_from_toml_str_databases() {
        let toml = r#"
            [databases.default]
            engine = "postgres"
            name = "app"

            [databases.reports]
            engine = "mysql"
            name = "warehouse"
        "#;

        let settings = from_toml_str(toml).unwrap();
        let db = settings.database("default").unwrap();
        assert_eq!(db.engine, "postgres");
        assert_eq!(db.name, "app");
        assert_eq!(settings.database("reports").unwrap().engine, "mysql");
    }

    #[test]
    fn test_from_toml_str_query_section() {
        let toml = r#"
            [query]
            explicit_save = true
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(settings.query.explicit_save);
        assert!(!settings.query.log_queries);
    }

    #[test]
    fn test_from_toml_str_empty() {
        let settings = from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_from_toml_str_invalid() {
        let result = from_toml_str("[[invalid toml content");
        assert!(matches!(result, Err(QuarryError::ConfigurationError(_))));
    }

    // ── JSON loading ────────────────────────────────────────────────

    #[test]
    fn test_from_json_str_basic() {
        let json = r#"{
            "debug": false,
            "log_level": "debug",
            "databases": {"default": {"name": "todo.db"}}
        }"#;

        let settings = from_json_str(json).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.log_level, "debug");
        let db = settings.default_database().unwrap();
        assert_eq!(db.name, "todo.db");
        assert_eq!(db.engine, "sqlite");
    }

    #[test]
    fn test_from_json_str_invalid() {
        assert!(from_json_str("{not json").is_err());
    }

    // ── Environment overrides ───────────────────────────────────────

    #[test]
    fn test_apply_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUARRY_DEBUG", "0"),
            ("QUARRY_LOG_LEVEL", "trace"),
            ("QUARRY_DATABASE_ENGINE", "mysql"),
            ("QUARRY_DATABASE_NAME", "shop"),
            ("QUARRY_EXPLICIT_SAVE", "yes"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_overrides(&mut settings, |key| env.get(key).map(ToString::to_string));

        assert!(!settings.debug);
        assert_eq!(settings.log_level, "trace");
        assert!(settings.query.explicit_save);
        let db = settings.default_database().unwrap();
        assert_eq!(db.engine, "mysql");
        assert_eq!(db.name, "shop");
    }

    #[test]
    fn test_apply_overrides_recreates_default_database() {
        let mut settings = Settings::default();
        settings.databases.clear();
        apply_overrides(&mut settings, |key| {
            (key == "QUARRY_DATABASE_NAME").then(|| "fresh.db".to_string())
        });
        assert_eq!(settings.default_database().unwrap().name, "fresh.db");
    }

    #[test]
    fn test_apply_overrides_none_set() {
        let mut settings = Settings::default();
        apply_overrides(&mut settings, |_| None);
        assert_eq!(settings, Settings::default());
    }
}

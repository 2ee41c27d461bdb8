//! Settings for the quarry toolkit.
//!
//! [`Settings`] holds the database connections, logging configuration and the
//! default behaviour of new query sets. Every struct deserializes from partial
//! input with defaults filled in, so a configuration file only needs to name
//! what it changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, QuarryResult};

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The engine name (`sqlite`, `postgres`, `mysql`).
    pub engine: String,
    /// The database name, or the file path (`:memory:` allowed) for `SQLite`.
    pub name: String,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: ":memory:".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Defaults applied to every freshly constructed query set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// When set, `update` only writes fields given as raw update expressions.
    pub explicit_save: bool,
    /// Emit every compiled statement at `debug` level.
    pub log_queries: bool,
}

/// The complete set of toolkit settings.
///
/// # Examples
///
/// ```
/// use quarry_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(settings.debug);
/// assert_eq!(settings.default_database().unwrap().engine, "sqlite");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // ── Core ─────────────────────────────────────────────────────────

    /// Whether debug mode is enabled.
    pub debug: bool,

    // ── Database ─────────────────────────────────────────────────────

    /// Database configurations, keyed by alias (e.g. "default").
    pub databases: HashMap<String, DatabaseSettings>,

    // ── Queries ──────────────────────────────────────────────────────

    /// Query set defaults.
    pub query: QuerySettings,

    // ── Logging ──────────────────────────────────────────────────────

    /// The log level (e.g. "info", "debug", "warn").
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            databases,
            query: QuerySettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Returns the database configured under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::NoDatabase`] if the alias is missing or its
    /// database name is empty.
    pub fn database(&self, alias: &str) -> QuarryResult<&DatabaseSettings> {
        match self.databases.get(alias) {
            Some(db) if !db.name.is_empty() => Ok(db),
            Some(_) => Err(QuarryError::NoDatabase(format!(
                "database '{alias}' has an empty name"
            ))),
            None => Err(QuarryError::NoDatabase(format!(
                "no database configured under '{alias}'"
            ))),
        }
    }

    /// Returns the `default` database.
    pub fn default_database(&self) -> QuarryResult<&DatabaseSettings> {
        self.database("default")
    }
}

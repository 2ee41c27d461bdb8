//! Core error types for the quarry toolkit.
//!
//! [`QuarryError`] is the single error enum shared by every crate in the
//! workspace. Variants are grouped by the layer that raises them: the model
//! registry and path walker, the expression engine, query terminals,
//! connection setup, transactions, and row hydration. Every variant carries
//! the offending identifier so that callers can report it directly.

use thiserror::Error;

/// The primary error type for the quarry toolkit.
///
/// Errors fall into two families. *Configuration* errors are programmer
/// mistakes detected while a query is compiled (unknown fields, unsupported
/// lookups, malformed raw templates); they are stable for a given program and
/// retrying never helps. *Runtime* errors come from the driver or from the data
/// itself. Use [`QuarryError::is_configuration`] to tell them apart.
#[derive(Error, Debug)]
pub enum QuarryError {
    // ── Registry & path walker ───────────────────────────────────────

    /// An operation referenced a model that was never registered.
    #[error("Model not registered: {0}")]
    NotRegistered(String),

    /// A field path segment does not name a field or relation.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// A non-terminal path segment names a plain field instead of a relation.
    #[error("Not a relation: {0}")]
    NotARelation(String),

    // ── Expressions ──────────────────────────────────────────────────

    /// No lookup with this name exists for the active driver.
    #[error("Unsupported lookup: {0}")]
    UnsupportedLookup(String),

    /// No SQL function with this name exists for the active driver.
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    /// A lookup received the wrong number or kind of arguments.
    #[error("Invalid lookup arguments: {0}")]
    LookupArgsInvalid(String),

    /// The driver has no template for the requested cast type.
    #[error("Cast not implemented: {0}")]
    CastNotImplemented(String),

    /// A raw template or expression could not be parsed or resolved.
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    // ── Query terminals ──────────────────────────────────────────────

    /// A query expected exactly one row but found none.
    #[error("No rows: {0}")]
    NoRows(String),

    /// A query expected exactly one row but found several.
    #[error("Multiple rows returned when one expected: {0}")]
    MultipleRows(String),

    /// The caller cancelled the query before it completed.
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    // ── Connections ──────────────────────────────────────────────────

    /// No usable database was configured.
    #[error("No database configured: {0}")]
    NoDatabase(String),

    /// The configured engine does not name a known driver.
    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    /// A driver-level failure (I/O, constraint violation, bad SQL).
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ── Transactions ─────────────────────────────────────────────────

    /// A transaction is already active on this compiler.
    #[error("Transaction already started")]
    TransactionStarted,

    /// Commit or rollback was requested with no active transaction.
    #[error("No active transaction")]
    NoTransaction,

    /// The driver returned no transaction handle.
    #[error("Transaction handle is missing: {0}")]
    TransactionNil(String),

    // ── Hydration & saving ───────────────────────────────────────────

    /// A scanned value cannot be converted to the field's declared type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A NULL was scanned or saved into a non-nullable field.
    #[error("Field cannot be null: {0}")]
    FieldNull(String),

    /// A required object or related instance was absent.
    #[error("Nil pointer: {0}")]
    NilPointer(String),

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl QuarryError {
    /// Returns `true` for programmer errors detected while building or
    /// compiling a query, and `false` for errors raised while talking to the
    /// database or reading its rows.
    pub const fn is_configuration(&self) -> bool {
        match self {
            Self::NotRegistered(_)
            | Self::FieldNotFound(_)
            | Self::NotARelation(_)
            | Self::UnsupportedLookup(_)
            | Self::UnsupportedFunction(_)
            | Self::LookupArgsInvalid(_)
            | Self::CastNotImplemented(_)
            | Self::InvalidExpression(_)
            | Self::NoDatabase(_)
            | Self::UnknownDriver(_)
            | Self::ConfigurationError(_) => true,
            Self::NoRows(_)
            | Self::MultipleRows(_)
            | Self::Cancelled(_)
            | Self::DatabaseError(_)
            | Self::TransactionStarted
            | Self::NoTransaction
            | Self::TransactionNil(_)
            | Self::TypeMismatch(_)
            | Self::FieldNull(_)
            | Self::NilPointer(_)
            | Self::IoError(_) => false,
        }
    }

    /// Wraps a driver error message with the statement that produced it.
    pub fn database(statement: &str, err: impl std::fmt::Display) -> Self {
        Self::DatabaseError(format!("{err} (while executing `{statement}`)"))
    }
}

/// A convenience type alias for `Result<T, QuarryError>`.
pub type QuarryResult<T> = Result<T, QuarryError>;

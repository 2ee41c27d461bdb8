//! # quarry-core
//!
//! Core types shared by every quarry crate: the error taxonomy, settings and
//! their loader, and tracing-based logging setup.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Toolkit settings
//! - [`settings_loader`] - TOML/JSON/environment settings loading
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{QuarryError, QuarryResult};
pub use settings::{DatabaseSettings, QuerySettings, Settings};

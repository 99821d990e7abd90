//! Settings loading and database connection URL resolution.

// Declare the modules that make up this crate.
pub mod connection;
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use connection::{
    ConnectionUrl, DEFAULT_DATABASE_URL, REDACTED_PASSWORD, resolve_connection_url,
    resolve_from_env,
};
pub use error::ConfigError;
pub use settings::{DEFAULT_PREFIX, Settings, load_settings, parse_overrides};

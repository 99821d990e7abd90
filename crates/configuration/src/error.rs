use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from file: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),

    #[error("Invalid connection URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid port '{0}': expected a number between 0 and 65535")]
    InvalidPort(String),

    #[error("Database name is missing from the connection URL")]
    MissingDatabaseName,

    #[error("Malformed override '{0}': expected key=value")]
    MalformedOverride(String),
}

use configuration::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Missing database setting '{0}'")]
    MissingSetting(String),

    #[error("Invalid database configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Invalid schema definition: {0}")]
    Schema(String),

    #[error("Naming convention error: {0}")]
    NamingConvention(String),

    #[error("Unknown column '{column}' on table '{table}'")]
    UnknownColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("Multiple rows were found in '{0}' when at most one was expected")]
    MultipleResultsFound(&'static str),

    #[error("Unknown query wrapper '{0}'")]
    UnknownQueryWrapper(String),

    #[error("The session's transaction has already ended; the session can no longer be used")]
    SessionClosed,

    #[error("The transaction has already been committed or aborted")]
    TransactionClosed,

    #[error("A session has already joined this transaction")]
    AlreadyJoined,

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),
}

//! Error types for the outreach core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Configuration-related errors. Fatal to the cycle that hit them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail transport errors (SMTP send / IMAP poll). Per-item: the same work
/// is retried on the next scheduled cycle, never in a tight loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for inbox {inbox}")]
    Auth { inbox: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// AI provider errors. A failed or malformed classification leaves the
/// response unclassified; it never blocks ingestion of further responses.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Malformed provider result: {0}")]
    Malformed(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for StudioFlow.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Collaborator error: {0}")]
    Collab(#[from] CollabError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Delivery channel errors.
///
/// `is_permanent()` separates errors worth retrying on the next scheduler
/// pass (provider timeout, rate limit) from errors that will never succeed
/// for this recipient (bad address, unconfigured transport). Both leave the
/// item due — the distinction only shapes the audit record.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {channel}: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("Rate limited on channel {channel}")]
    RateLimited { channel: String },

    #[error("Invalid recipient for channel {channel}: {target}")]
    InvalidRecipient { channel: String, target: String },

    #[error("Channel {channel} is not configured")]
    NotConfigured { channel: String },

    #[error("Subject {subject_id} has no {field} on file")]
    MissingContactField { subject_id: Uuid, field: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ChannelError {
    /// True for errors that cannot succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidRecipient { .. }
                | ChannelError::NotConfigured { .. }
                | ChannelError::MissingContactField { .. }
        )
    }
}

/// Rule configuration errors.
///
/// These are evaluation-time skips, never user-visible send failures: a
/// malformed rule is logged and the rest of the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Automation {id} is missing {field}")]
    MissingField { id: Uuid, field: String },

    #[error("Automation {id} has invalid {field}: {message}")]
    InvalidField {
        id: Uuid,
        field: String,
        message: String,
    },

    #[error("Unknown {what}: {value}")]
    UnknownTag { what: String, value: String },

    #[error("Template {template_id} not found")]
    TemplateNotFound { template_id: Uuid },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// External collaborator errors (pipeline, calendar, directory).
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("{service} collaborator unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{service} lookup failed: {reason}")]
    Lookup { service: String, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

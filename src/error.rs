//! Error types for the outreach engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Mailer error: {0}")]
    Mailer(#[from] MailerError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
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

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Delivery queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is not running (status {status})")]
    NotRunning { id: Uuid, status: String },

    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Outbound mail errors.
///
/// The variants separate problems an operator has to fix (credentials,
/// DNS, rejected recipients) from ones that clear up by themselves.
#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("Could not reach SMTP server {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("SMTP authentication failed for {mailbox}: {reason}")]
    Authentication { mailbox: String, reason: String },

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Temporary send failure: {0}")]
    Transient(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl MailerError {
    /// Whether the delivery queue should retry the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Transient(_))
    }

    /// Whether the failure needs someone to fix mailbox settings.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Connection { .. })
    }
}

/// Campaign lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Invalid send window: {0}")]
    InvalidWindow(String),

    #[error("Invalid sequence step: {0}")]
    InvalidStep(String),

    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("Not an engagement event: {0}")]
    NotEngagement(String),

    #[error("Campaign {0} has no leads without an open to resend to")]
    NoNonOpeners(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

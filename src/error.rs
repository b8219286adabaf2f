//! Error types for the routing engine

use thiserror::Error;

/// Result type alias for the routing engine
pub type Result<T> = std::result::Result<T, RouterError>;

/// Main error type for the routing engine
#[derive(Debug, Error)]
pub enum RouterError {
    /// Request rejected before any handler ran
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Strategy failed or proposed something unusable
    #[error("Strategy error: {message}")]
    Strategy { message: String },

    /// Handler invocation failed or timed out
    #[error("Handler error ({handler_id}): {message}")]
    Handler { handler_id: String, message: String },

    /// Confirmation could not be resolved
    #[error("Confirmation error: {0}")]
    Confirmation(#[from] ConfirmationError),

    /// Invalid configuration or assembly
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    Provider(#[from] async_openai::error::OpenAIError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl RouterError {
    pub fn config(message: impl Into<String>) -> Self {
        RouterError::Config {
            message: message.into(),
        }
    }

    pub fn strategy(message: impl Into<String>) -> Self {
        RouterError::Strategy {
            message: message.into(),
        }
    }

    /// Converts a boxed service error, keeping typed router errors intact.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<RouterError>() {
            Ok(e) => *e,
            Err(other) => match other.downcast::<ValidationError>() {
                Ok(v) => RouterError::Validation(*v),
                Err(other) => match other.downcast::<ConfirmationError>() {
                    Ok(c) => RouterError::Confirmation(*c),
                    Err(other) => RouterError::Other(other.to_string()),
                },
            },
        }
    }
}

/// Malformed or unserviceable requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message text is empty and no attachment was supplied")]
    EmptyRequest,

    #[error("missing {field}")]
    MissingField { field: &'static str },

    #[error("unknown handler requested: {handler_id}")]
    UnknownHandler { handler_id: String },

    #[error("handler listed more than once: {handler_id}")]
    DuplicateHandler { handler_id: String },

    #[error("parallel mode requires at least one target handler")]
    NoTargets,

    #[error("batch of {requested} handlers exceeds the cap of {cap}")]
    BatchCapExceeded { requested: usize, cap: usize },
}

/// Failures resolving a pending confirmation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("unknown confirmation id: {id}")]
    Unknown { id: String },

    #[error("confirmation {id} was already resolved")]
    AlreadyResolved { id: String },

    #[error("confirmation {id} expired")]
    Expired { id: String },

    #[error("confirmation {id} belongs to another session")]
    SessionMismatch { id: String },

    #[error("'{response}' is not one of the offered options: {options:?}")]
    InvalidOption {
        response: String,
        options: Vec<String>,
    },

    #[error("confirmation store failure: {message}")]
    Store { message: String },
}

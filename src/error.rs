//! Error taxonomy for the butler core
//!
//! Configuration errors abort startup. Everything else is caught at the
//! coordinator boundary and turned into a user-visible response.

use serde::Serialize;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ButlerError>;

#[derive(Debug, thiserror::Error)]
pub enum ButlerError {
    /// Unknown agent/tool/prompt referenced in static configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing credential or unreachable external system
    #[error("{integration} is unavailable: {detail}")]
    DependencyUnavailable { integration: String, detail: String },

    /// No registered agent for an agent name or intent
    #[error("no registered agent for '{0}'")]
    DelegationTargetNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// External tool ran but reported a failure
    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Failure category shown to the user. Carries no internal identifiers.
///
/// Permission denials and pending confirmations are not errors: they travel
/// as gate decisions and tool call statuses, and only a denial that ends a
/// turn is reported here as `AuthorizationDenied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    AuthorizationDenied,
    DependencyUnavailable,
    DelegationTargetNotFound,
    InvalidInput,
    Internal,
    Cancelled,
}

impl ButlerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ButlerError::Configuration(_) => FailureKind::Configuration,
            ButlerError::DependencyUnavailable { .. } => FailureKind::DependencyUnavailable,
            ButlerError::DelegationTargetNotFound(_) => FailureKind::DelegationTargetNotFound,
            ButlerError::InvalidInput(_) => FailureKind::InvalidInput,
            ButlerError::Cancelled => FailureKind::Cancelled,
            ButlerError::Storage(_)
            | ButlerError::ToolFailed(_)
            | ButlerError::Io(_)
            | ButlerError::Yaml(_)
            | ButlerError::Json(_)
            | ButlerError::Sqlite(_) => FailureKind::Internal,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ButlerError::Configuration(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ButlerError::Storage(message.into())
    }
}

impl FailureKind {
    /// Explanation shown to the user when a turn fails in this category
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::Configuration => {
                "I'm not set up correctly for that yet. Please check the butler configuration."
            }
            FailureKind::AuthorizationDenied => {
                "I'm not allowed to do that on your behalf, so I stopped before making any changes."
            }
            FailureKind::DependencyUnavailable => {
                "A service I need isn't connected right now."
            }
            FailureKind::DelegationTargetNotFound => {
                "Sorry, I don't have a specialist who can handle that request yet."
            }
            FailureKind::InvalidInput => "I couldn't read that message. Please try again.",
            FailureKind::Internal => {
                "Sorry, something went wrong on my side while handling that."
            }
            FailureKind::Cancelled => "Okay, I stopped working on that.",
        }
    }
}

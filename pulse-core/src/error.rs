//! Error types for Pulse operations

use crate::Timestamp;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Key codec errors. These are programmer errors and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key shape for {entity}: {reason}")]
    InvalidKeyShape { entity: String, reason: String },

    #[error("Entity name must not be empty")]
    EmptyEntity,
}

/// Failures surfaced by fetchers and mutation commits.
///
/// The transport layer wraps its status codes into these variants; the
/// engine never looks at HTTP itself. The type is `Clone` so one
/// deduplicated result can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Server responded with status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Mutation rejected by a concurrent server-side change: {message}")]
    MutationConflict { message: String },

    #[error("No fetcher registered for entity {entity}")]
    NoFetcher { entity: String },

    #[error("No mutator registered for entity {entity}")]
    NoMutator { entity: String },

    #[error("Request aborted: {reason}")]
    Aborted { reason: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::MutationConflict {
            message: message.into(),
        }
    }

    /// Classify a transport status code.
    ///
    /// 409 is reported as a mutation conflict; every other non-success
    /// status becomes `Server`.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            409 => Self::conflict(message),
            _ => Self::server(status, message),
        }
    }

    /// Network failures, timeouts and 5xx responses may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Server { status, .. } => (500..600).contains(status),
            Self::MutationConflict { .. }
            | Self::NoFetcher { .. }
            | Self::NoMutator { .. }
            | Self::Aborted { .. } => false,
        }
    }

    /// Returns true for 4xx responses, including conflicts.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Server { status, .. } => (400..500).contains(status),
            Self::MutationConflict { .. } => true,
            _ => false,
        }
    }
}

/// The most recent failed fetch recorded on a query entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub error: FetchError,
    /// Attempts made before giving up, including the first.
    pub attempts: u32,
    pub failed_at: Timestamp,
}

impl ErrorRecord {
    pub fn new(error: FetchError, attempts: u32, failed_at: Timestamp) -> Self {
        Self {
            error,
            attempts,
            failed_at,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Engine lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Subscription not found: {subscription_id}")]
    SubscriptionNotFound { subscription_id: Uuid },

    #[error("Engine has been shut down")]
    ShutDown,
}

/// Master error type for all Pulse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PulseError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result type alias for Pulse operations.
pub type PulseResult<T> = Result<T, PulseError>;

// =============================================================================
// TESTS
// =============================================================================

//! Error types for a3s-fabric

use thiserror::Error;

/// Errors that can occur anywhere in the routing fabric
#[derive(Debug, Error)]
pub enum FabricError {
    /// Invalid or incomplete configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Forwarding an event to a target failed
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A consumer handler signaled failure
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue state persistence failure
    #[error("Store error: {0}")]
    Store(String),

    /// Bus, queue or rule not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Per-event forwarding failure
///
/// The event is dropped at the hop that produced the error. The router never
/// retries; retries belong to the publisher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The target bus or queue does not exist
    #[error("Target not found: {kind} '{name}'")]
    TargetNotFound { kind: &'static str, name: String },

    /// The target's capability does not allow the action
    #[error("Permission denied for target '{target}': {reason}")]
    PermissionDenied { target: String, reason: String },

    /// The event crossed more buses than the configured hop limit
    #[error("Hop limit {limit} exceeded for event {event_id}")]
    HopLimitExceeded { event_id: String, limit: usize },

    /// The queue could not accept the message in time
    #[error("Queue '{queue}' unavailable: {reason}")]
    QueueUnavailable { queue: String, reason: String },
}

/// Failure signaled by a consumer handler
///
/// The message stays hidden and is redelivered after its visibility timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Handler failed: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

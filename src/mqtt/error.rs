//! Error definitions for the session layer

use super::transport::TransportError;
use thiserror::Error;

/// Errors returned by the session controller and its components
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every subscription slot is taken
    #[error("Subscription table full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// No registration matches the given topic
    #[error("No subscription found for topic: {0}")]
    NotFound(String),

    /// Operation issued before `init` or after `deinit`
    #[error("MQTT session not initialized")]
    NotInitialized,

    /// `init` called while a session is still active
    #[error("MQTT session already initialized")]
    AlreadyInitialized,

    /// Connection parameters are missing mandatory fields
    #[error("Invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// Caller passed an unusable argument (empty topic and similar)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The wire client refused or failed a request
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Memory for a table slot or a reassembly buffer could not be reserved
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// Continuation chunk without a matching fragment header
    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),
}

use thiserror::Error;

/// Errors raised by a listener client talking to the message fabric
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transport-level errors (network, connection)
    #[error("Transport error: {message} (client: {client})")]
    Transport { client: String, message: String },

    /// The fabric call did not complete in time
    #[error("Timeout after {timeout_ms}ms (client: {client})")]
    Timeout { client: String, timeout_ms: u64 },

    /// The client has been stopped or was never started
    #[error("Client stopped: {0}")]
    Stopped(String),

    /// The fabric does not support the requested operation
    #[error("Operation not supported by client {client}: {operation}")]
    Unsupported { client: String, operation: String },

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Check if a later attempt against the same client may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport { .. } => true,
            ClientError::Timeout { .. } => true,
            ClientError::Stopped(_) => false,
            ClientError::Unsupported { .. } => false,
            ClientError::Internal(_) => false,
        }
    }
}

/// Errors surfaced while configuring, starting or stopping a messaging service.
///
/// These are fatal to the service they come from and always reach the caller.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No clients defined for channel {channel_id}")]
    NoClientsDefined { channel_id: String },

    #[error("Invalid partition configuration for channel {channel_id}: {reason}")]
    PartitionConfiguration { channel_id: String, reason: String },

    #[error("Priority {priority} cannot be resolved for channel {channel_id}")]
    PriorityNotResolvable { channel_id: String, priority: i32 },

    #[error("Invalid concurrency budget: {0}")]
    InvalidConcurrency(usize),

    #[error("Service for channel {0} is already running")]
    AlreadyRunning(String),

    #[error("Service for channel {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

//! Error types and handling for the lrpc bus

/// Result type alias for lrpc operations
pub type Result<T> = std::result::Result<T, LrpcError>;

/// Error types for the pub/sub bus
///
/// The first group mirrors the caller-visible error codes of the public node
/// API; the second group covers resource and transport failures that surface
/// through node construction and the shared-memory layer.
#[derive(Debug, thiserror::Error)]
pub enum LrpcError {
    /// Invalid arguments (empty subject, oversized payload, bad node id, ...)
    #[error("invalid argument: {parameter} - {message}")]
    InvalidArgument { parameter: String, message: String },

    /// Operation on a node that is not running
    #[error("node not initialized or already shut down")]
    NotInitialized,

    /// Entity already exists (node id, channel name, ...)
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// Entity not found (subscription, peer node, directory entry, ...)
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Transport-level delivery failure (peer unreachable, segment gone)
    #[error("network error: {message}")]
    Network { message: String },

    /// Backpressure: a destination queue is full
    #[error("timeout (queue full): {message}")]
    Timeout { message: String },

    /// Catch-all for states that should not be reachable
    #[error("unexpected error: {message}")]
    Unexpected { message: String },

    /// I/O failures (shm_open, ftruncate, mmap, ...)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Memory mapping or layout failures
    #[error("memory error: {message}")]
    Memory { message: String },

    /// Corrupt frame, packet, or shared-memory header
    #[error("corruption detected: {message}")]
    Corruption { message: String },

    /// The global node directory has no free entries
    #[error("node directory full (capacity {capacity})")]
    DirectoryFull { capacity: usize },

    /// Platform primitive failures (semaphores, process probes, ...)
    #[error("platform error: {message}")]
    Platform { message: String },

    /// Serialization failures for system-message payloads
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl LrpcError {
    /// Create an invalid argument error
    pub fn invalid_argument(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a queue-full backpressure error
    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an unexpected error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error is recoverable backpressure rather than a hard fault
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for LrpcError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for LrpcError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(format!("bincode error: {}", err))
    }
}

impl From<nix::errno::Errno> for LrpcError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::platform(format!("errno: {}", err))
    }
}

//! Error types shared across the runtime

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur in the runtime core
///
/// Failure causes are stored inside events and handed to every waiter that
/// observes the failed event, so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// No valid physical instance could be produced for a region requirement
    #[error("mapping failure: operation {op} requirement {index}")]
    MappingFailure { op: u64, index: u32 },

    /// A region requirement exceeded the privileges of the parent context
    #[error("privilege violation: {0}")]
    PrivilegeViolation(String),

    /// The device reported an error; the owning scheduler is dead
    #[error("device {device} failure: {message}")]
    DeviceFailure { device: usize, message: String },

    /// A partitioning operator received invalid input
    #[error("partitioning failure: {0}")]
    PartitioningFailure(String),

    /// Suballocator could not satisfy an allocation
    #[error("out of memory: requested {requested} bytes, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    /// Wire message carried a payload tag with no registered decoder
    #[error("unknown payload tag: {0:#06x}")]
    UnknownPayloadTag(u16),

    /// Wire message could not be framed or decoded
    #[error("wire format error: {0}")]
    WireFormat(String),

    /// A handle referred to a resource that does not exist
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Catch-all for contract violations surfaced to the caller
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl RuntimeError {
    /// Create a device failure error
    pub fn device(device: usize, message: impl Into<String>) -> Self {
        Self::DeviceFailure {
            device,
            message: message.into(),
        }
    }

    /// Create a partitioning failure error
    pub fn partitioning(msg: impl Into<String>) -> Self {
        Self::PartitioningFailure(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}

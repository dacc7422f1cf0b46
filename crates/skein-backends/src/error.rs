//! Error types for backend operations

use skein_base::RuntimeError;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during backend submission and completion
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The device API rejected a call; the owning scheduler is unusable
    #[error("device {device} api error: {message}")]
    DeviceApi { device: usize, message: String },

    /// Submission referenced a stream the device does not have
    #[error("invalid stream: {0}")]
    InvalidStream(String),

    /// Kernel function id has no registered implementation
    #[error("unknown kernel function: {0}")]
    UnknownKernel(u64),

    /// Copy or fill touched memory outside a registered range
    #[error("address range out of bounds: base {base:#x} len {len}")]
    AddressOutOfBounds { base: u64, len: usize },

    /// The scheduler was marked dead by an earlier device error
    #[error("scheduler for device {0} is dead")]
    SchedulerDead(usize),

    /// The scheduler has shut down and accepts no more work
    #[error("scheduler for device {0} is shut down")]
    SchedulerShutdown(usize),
}

impl BackendError {
    pub fn api(device: usize, message: impl Into<String>) -> Self {
        Self::DeviceApi {
            device,
            message: message.into(),
        }
    }
}

impl From<BackendError> for RuntimeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DeviceApi { device, message } => {
                RuntimeError::DeviceFailure { device, message }
            }
            BackendError::SchedulerDead(device) => RuntimeError::DeviceFailure {
                device,
                message: "scheduler dead".to_string(),
            },
            BackendError::SchedulerShutdown(device) => RuntimeError::DeviceFailure {
                device,
                message: "scheduler shut down".to_string(),
            },
            other => RuntimeError::InvalidOperation(other.to_string()),
        }
    }
}

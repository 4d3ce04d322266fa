//! Error types for the runtime crate.

use thiserror::Error;

/// Errors raised by the wgpu back-end.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    InitError(String),

    /// Buffer allocation failed.
    #[error("Buffer allocation failed: {0}")]
    AllocationError(String),

    /// An address that does not name a live buffer of this device.
    #[error("No buffer at address {0:#x}")]
    UnknownBuffer(u64),

    /// Upload, download or relayout of buffer contents failed.
    #[error("Transfer failed: {0}")]
    TransferError(String),

    /// wgpu error.
    #[error("wgpu error: {0}")]
    WgpuError(String),

    /// Buffer async error.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<RuntimeError> for conflux_core::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::AllocationError(msg) => conflux_core::Error::Allocation(msg),
            RuntimeError::InitError(msg) => conflux_core::Error::Unsupported(msg),
            other => conflux_core::Error::Conversion(other.to_string()),
        }
    }
}

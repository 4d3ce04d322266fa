//! Core data model and collaborator contracts for Conflux kernels.
//!
//! This crate provides the foundational abstractions the kernel crates build on:
//! - Tensor metadata (`DataType`, `DataFormat`, `TensorShape`) and `Tensor`
//! - Device memory handles (`BufferDesc`) and the scope guard that releases them
//! - The device/allocator contract (`Device`, `DataConverter`)
//! - The accelerated primitive contract (`ConvPrimitives`)
//! - The per-device context owning fusion-group buffers (`DeviceContext`)
//! - The kernel contract exposed to the execution graph (`Kernel`, `KernelExecContext`)
//! - A host-side layout converter (`layout::relayout_host`)

pub mod buffer;
pub mod context;
pub mod device;
pub mod kernel;
pub mod layout;
pub mod primitive;
pub mod tensor;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export commonly used types
pub use buffer::{BufferDesc, ScopedBuffer};
pub use context::{DeviceContext, GroupId};
pub use device::{DataConverter, Device, DeviceProps, StreamHandle};
pub use kernel::{Kernel, KernelExecContext, WeightPayload};
pub use primitive::{
    Activation, AlgoParams, ConcatFuse, ConvParams, ConvPrimitives, EltwiseFuse, ForwardArgs,
    FuseParams, JitKernel,
};
pub use tensor::Tensor;
pub use types::{DataFormat, DataType, TensorShape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by the device contract, the primitive contract and kernels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operand shapes are structurally incompatible.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Device memory exhaustion or allocator failure.
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Allocation failed while binding a buffer to a named tensor.
    #[error("Allocation failed for tensor[{tensor}]: {source}")]
    TensorAllocation {
        tensor: String,
        #[source]
        source: Box<Error>,
    },

    /// Layout conversion failed (host-to-device or device-to-device).
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// The primitive asked for more scratch memory than the hard cap allows.
    #[error("Workspace of {requested} bytes exceeds cap of {cap} bytes")]
    WorkspaceSizing { requested: u64, cap: u64 },

    /// The workspace sizing query itself failed.
    #[error("Workspace sizing query failed: {0}")]
    WorkspaceQuery(String),

    /// Static operator configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No kernel variant handles the requested combination.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The primitive could not be enqueued.
    #[error("Launch error: {0}")]
    Launch(String),
}

impl Error {
    /// Whether this error reports a device memory failure, with or without a
    /// tensor attached.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Error::Allocation(_) | Error::TensorAllocation { .. })
    }

    /// Whether this error reports a workspace sizing failure.
    pub fn is_workspace_sizing(&self) -> bool {
        matches!(
            self,
            Error::WorkspaceSizing { .. } | Error::WorkspaceQuery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_allocation_message_names_tensor() {
        let err = Error::TensorAllocation {
            tensor: "conv_out".to_string(),
            source: Box::new(Error::Allocation("out of memory".to_string())),
        };
        assert!(err.is_allocation());
        assert_eq!(
            err.to_string(),
            "Allocation failed for tensor[conv_out]: Allocation error: out of memory"
        );
    }

    #[test]
    fn test_workspace_sizing_kind() {
        let err = Error::WorkspaceSizing {
            requested: 10,
            cap: 5,
        };
        assert!(err.is_workspace_sizing());
        assert!(!err.is_allocation());
    }
}

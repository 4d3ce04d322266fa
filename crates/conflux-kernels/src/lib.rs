//! Device kernels built on the Conflux core contracts.
//!
//! Currently one operator: a fusion-aware convolution whose per-invocation
//! pipeline manages output buffers, the weight relayout cache and the
//! primitive's workspace.

pub mod conv;

pub use conv::{
    ConvConfig, ConvKernel, ConvVariant, ExecState, FuseInfo, FuseOp, KernelOptions,
    DEFAULT_WORKSPACE_CAP,
};

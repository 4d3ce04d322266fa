//! Convolution operator.
//!
//! - [`config`]: static attributes, fusion metadata and runtime options
//! - [`resolve`]: output shape inference and geometry resolution
//! - [`fuse`]: fused epilogue resolution
//! - [`output`]: output binding, including shared concat buffers
//! - [`weight`]: weight relayout cache
//! - [`workspace`]: per-invocation scratch memory
//! - [`variant`]: precision paths and capability dispatch
//! - [`kernel`]: the pipeline tying the steps together

pub mod config;
pub mod fuse;
pub mod kernel;
pub mod output;
pub mod resolve;
pub mod variant;
pub mod weight;
pub mod workspace;

pub use config::{ConvConfig, FuseInfo, FuseOp, KernelOptions, DEFAULT_WORKSPACE_CAP};
pub use kernel::{ConvKernel, ExecState};
pub use variant::ConvVariant;
pub use weight::{WeightBinding, WeightCache};

//! Contract of the accelerated convolution primitive library.
//!
//! The arithmetic lives behind this trait. Kernels only size workspaces,
//! request weight relayouts and enqueue forward passes.

use crate::buffer::BufferDesc;
use crate::device::{DeviceProps, StreamHandle};
use crate::types::DataType;
use crate::Result;

/// Fully resolved convolution geometry for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvParams {
    pub in_num: usize,
    pub num_chl: usize,
    pub num_chl_pad: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub num_flt: usize,
    pub num_flt_pad: usize,
    pub flt_height: usize,
    pub flt_width: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub pad_height: usize,
    pub pad_width: usize,
    pub hole_height: usize,
    pub hole_width: usize,
    pub num_grp: usize,
}

/// Post-processing activation fused into the convolution epilogue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Clip { min: f32, max: f32 },
    LeakyRelu { alpha: f32 },
    /// Per-channel slopes read from a device buffer.
    PRelu { slope_addr: u64 },
}

/// Element-wise add of another tensor into the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EltwiseFuse {
    /// Device address of the addend.
    pub addend_addr: u64,

    /// Activation applied after the add.
    pub activation: Option<Activation>,
}

/// Placement of the output inside a concat fusion buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatFuse {
    /// First channel this operator writes.
    pub channel_offset: usize,

    /// Padded channel count of the whole group buffer.
    pub channel_stride: usize,
}

/// Resolved fused post-processing for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuseParams {
    pub activation: Option<Activation>,
    pub eltwise: Option<EltwiseFuse>,
    pub concat: Option<ConcatFuse>,
}

/// Algorithm tuning chosen ahead of time for this operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgoParams {
    /// Kernel id inside the primitive library.
    pub kernel_id: u32,

    pub kernel_name: String,

    /// Split factor along the reduction dimension.
    pub splitk: u32,

    /// Split factor along the filter dimension.
    pub splitf: u32,
}

/// A kernel function compiled at runtime for this operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitKernel {
    pub module: String,
    pub function: String,
}

/// Buffers and parameters of one forward call.
#[derive(Debug, Clone)]
pub struct ForwardArgs<'a> {
    pub input: u64,
    pub weight: u64,
    pub output: u64,
    pub bias: Option<u64>,
    pub workspace: BufferDesc,
    pub algo: &'a AlgoParams,
    pub conv: &'a ConvParams,
    pub fuse: &'a FuseParams,
    pub jit: Option<&'a JitKernel>,
}

/// Accelerated convolution routines.
pub trait ConvPrimitives: Send + Sync {
    /// Scratch bytes the forward pass needs for this configuration.
    ///
    /// `cap` is the caller's hard ceiling; implementations may use it to pick
    /// a split that fits, and callers reject any answer above it.
    fn workspace_size(
        &self,
        dtype: DataType,
        params: &ConvParams,
        algo: &AlgoParams,
        cap: u64,
    ) -> Result<u64>;

    /// Enqueue conversion of a weight from its stored layout in `src` into
    /// the primitive's preferred layout in `dst`.
    fn relayout_weight(
        &self,
        stream: StreamHandle,
        dst: &BufferDesc,
        src: &BufferDesc,
        dtype: DataType,
        params: &ConvParams,
    ) -> Result<()>;

    /// Enqueue the forward convolution. Returns once the work is queued.
    fn forward(
        &self,
        props: &DeviceProps,
        stream: StreamHandle,
        dtype: DataType,
        args: &ForwardArgs<'_>,
    ) -> Result<()>;
}

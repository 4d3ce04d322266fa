//! Static configuration of a convolution operator.

use conflux_core::{AlgoParams, Error, GroupId, JitKernel, Result};

/// Hard ceiling on the scratch memory a single invocation may request (8 GiB).
pub const DEFAULT_WORKSPACE_CAP: u64 = 8 * 1024 * 1024 * 1024;

/// One fused post-processing step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FuseOp {
    Relu,
    Sigmoid,
    Clip { min: f32, max: f32 },
    LeakyRelu { alpha: f32 },
    /// Per-channel slopes taken from the kernel input at `slope_input`.
    PRelu { slope_input: usize },
    /// Element-wise add of the kernel input at `input`.
    Add { input: usize },
}

impl FuseOp {
    pub fn is_activation(&self) -> bool {
        !matches!(self, FuseOp::Add { .. })
    }
}

/// Fusion metadata attached to the operator by the graph optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct FuseInfo {
    /// Post-processing steps fused into the epilogue.
    pub ops: Vec<FuseOp>,

    /// First channel this operator writes in the shared concat buffer, or a
    /// negative value when the output is not part of a concat group.
    pub channel_offset: i64,

    /// Total channel count declared for the whole concat group.
    pub channel_size: usize,

    /// Group id of the concat this output feeds.
    pub concat_edge_id: GroupId,
}

impl FuseInfo {
    /// Fusion info placing the output at `channel_offset` of a concat group
    /// declaring `channel_size` channels in total.
    pub fn concat(concat_edge_id: GroupId, channel_offset: usize, channel_size: usize) -> Self {
        Self {
            channel_offset: channel_offset as i64,
            channel_size,
            concat_edge_id,
            ..Default::default()
        }
    }

    pub fn with_ops(mut self, ops: Vec<FuseOp>) -> Self {
        self.ops = ops;
        self
    }

    /// Whether the output is written into a shared concat buffer.
    pub fn joins_concat(&self) -> bool {
        self.channel_offset >= 0
    }
}

impl Default for FuseInfo {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            channel_offset: -1,
            channel_size: 0,
            concat_edge_id: 0,
        }
    }
}

/// Attributes and optimizer decisions for one convolution node.
///
/// Operand order in the execution context: input 0 is the activation, input
/// 1 the weight, input 2 the bias when `bias_term` is set. Fused operands
/// referenced by [`FuseOp`] follow.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    /// Expected `[kh, kw]`; checked against the weight when present.
    pub kernel_shape: Option<[usize; 2]>,
    pub strides: [usize; 2],
    /// `[top, left, bottom, right]`.
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
    pub group: usize,
    pub bias_term: bool,

    /// The weight is a constant of the model rather than an upstream output.
    pub is_initializer_weight: bool,

    pub fuse: FuseInfo,
    pub algo: AlgoParams,
    pub jit: Option<JitKernel>,
}

impl ConvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.strides.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "strides must be positive, got {:?}",
                self.strides
            )));
        }
        if self.dilations.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "dilations must be positive, got {:?}",
                self.dilations
            )));
        }
        if self.group == 0 {
            return Err(Error::InvalidConfig("group must be positive".to_string()));
        }
        if self.fuse.joins_concat() && self.fuse.channel_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "concat group {} declares zero channels",
                self.fuse.concat_edge_id
            )));
        }
        Ok(())
    }
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            kernel_shape: None,
            strides: [1, 1],
            pads: [0; 4],
            dilations: [1, 1],
            group: 1,
            bias_term: false,
            is_initializer_weight: true,
            fuse: FuseInfo::default(),
            algo: AlgoParams::default(),
            jit: None,
        }
    }
}

/// Per-kernel runtime knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOptions {
    /// Largest workspace an invocation may acquire.
    pub workspace_cap: u64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            workspace_cap: DEFAULT_WORKSPACE_CAP,
        }
    }
}

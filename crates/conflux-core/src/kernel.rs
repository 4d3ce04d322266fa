//! Kernel contract exposed to the execution graph.

use crate::buffer::BufferDesc;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Operand tensors of one kernel invocation.
///
/// The execution graph fills inputs (already bound to buffers) and outputs
/// (shapes only) before calling into the kernel; the kernel binds output
/// buffers during `before_execute`.
#[derive(Debug, Default)]
pub struct KernelExecContext {
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

impl KernelExecContext {
    pub fn new(inputs: Vec<Tensor>, outputs: Vec<Tensor>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&Tensor> {
        self.inputs.get(index).ok_or_else(|| {
            Error::Shape(format!(
                "input {index} requested but kernel has {} inputs",
                self.inputs.len()
            ))
        })
    }

    pub fn output(&self, index: usize) -> Result<&Tensor> {
        self.outputs.get(index).ok_or_else(|| {
            Error::Shape(format!(
                "output {index} requested but kernel has {} outputs",
                self.outputs.len()
            ))
        })
    }

    pub fn output_mut(&mut self, index: usize) -> Result<&mut Tensor> {
        let count = self.outputs.len();
        self.outputs.get_mut(index).ok_or_else(|| {
            Error::Shape(format!(
                "output {index} requested but kernel has {count} outputs"
            ))
        })
    }

    pub fn outputs_mut(&mut self) -> &mut [Tensor] {
        &mut self.outputs
    }

    /// Take the operand tensors back, e.g. to release output buffers.
    pub fn into_parts(self) -> (Vec<Tensor>, Vec<Tensor>) {
        (self.inputs, self.outputs)
    }
}

/// New weight data handed to [`Kernel::update_weight`].
#[derive(Debug, Clone, Copy)]
pub enum WeightPayload<'a> {
    /// Bytes in host memory.
    Host(&'a [u8]),

    /// A buffer already resident on the kernel's device.
    Device(BufferDesc),
}

impl WeightPayload<'_> {
    pub fn is_on_device(&self) -> bool {
        matches!(self, WeightPayload::Device(_))
    }
}

/// A dispatchable operator bound to one device.
///
/// Callers serialize calls on one kernel instance; `&mut self` makes that
/// explicit.
pub trait Kernel: Send {
    /// Kernel name, used in logs and errors.
    fn name(&self) -> &str;

    /// Resolve output shapes and bind output buffers.
    fn before_execute(&mut self, ctx: &mut KernelExecContext) -> Result<()>;

    /// Replace the weight with new data; the next `execute` re-runs the
    /// weight relayout.
    fn update_weight(&mut self, ctx: &KernelExecContext, payload: WeightPayload<'_>) -> Result<()>;

    /// Run one invocation: `before_execute`, then enqueue the compute work.
    fn execute(&mut self, ctx: &mut KernelExecContext) -> Result<()>;
}

//! Resolution of fused post-processing into primitive parameters.

use super::config::{FuseInfo, FuseOp};
use conflux_core::types::align_up;
use conflux_core::{
    Activation, ConcatFuse, EltwiseFuse, Error, FuseParams, KernelExecContext, Result, TensorShape,
};

/// Where the next fused op may appear in the epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    PreActivation,
    Eltwise,
    PostActivation,
    Closed,
}

/// Turn the configured fuse chain into the parameters the primitive expects.
///
/// The accepted chain is `[activation] [add [activation]]`. Operands named
/// by the chain are looked up in `ctx`; the add's operand must have the
/// output's dims, a PRelu slope one value per output channel (or a single
/// shared value).
pub fn resolve_fuse_params(
    info: &FuseInfo,
    ctx: &KernelExecContext,
    output: &TensorShape,
) -> Result<FuseParams> {
    let mut params = FuseParams::default();
    let mut slot = Slot::PreActivation;

    for op in &info.ops {
        match (slot, op) {
            (Slot::PreActivation | Slot::Eltwise, FuseOp::Add { input }) => {
                let addend = ctx.input(*input)?;
                if addend.shape().dims() != output.dims() {
                    return Err(Error::Shape(format!(
                        "fused Add operand {} has dims {:?}, output has {:?}",
                        addend.name(),
                        addend.shape().dims(),
                        output.dims()
                    )));
                }
                params.eltwise = Some(EltwiseFuse {
                    addend_addr: addend.buffer_addr(),
                    activation: None,
                });
                slot = Slot::PostActivation;
            }
            (Slot::PreActivation, activation) => {
                params.activation = Some(resolve_activation(activation, ctx, output)?);
                slot = Slot::Eltwise;
            }
            (Slot::PostActivation, activation) if activation.is_activation() => {
                let resolved = resolve_activation(activation, ctx, output)?;
                if let Some(eltwise) = params.eltwise.as_mut() {
                    eltwise.activation = Some(resolved);
                }
                slot = Slot::Closed;
            }
            (_, op) => {
                return Err(Error::InvalidConfig(format!(
                    "fused op {op:?} cannot follow the existing chain {:?}",
                    info.ops
                )));
            }
        }
    }

    if info.joins_concat() {
        let offset = info.channel_offset as usize;
        let channels = output.dim(1);
        if offset + channels > info.channel_size {
            return Err(Error::InvalidConfig(format!(
                "channels [{offset}, {}) exceed concat group {} of {} channels",
                offset + channels,
                info.concat_edge_id,
                info.channel_size
            )));
        }
        params.concat = Some(ConcatFuse {
            channel_offset: offset,
            channel_stride: align_up(info.channel_size, output.format().channel_alignment()),
        });
    }

    Ok(params)
}

fn resolve_activation(op: &FuseOp, ctx: &KernelExecContext, output: &TensorShape) -> Result<Activation> {
    match *op {
        FuseOp::Relu => Ok(Activation::Relu),
        FuseOp::Sigmoid => Ok(Activation::Sigmoid),
        FuseOp::Clip { min, max } => {
            if min > max {
                return Err(Error::InvalidConfig(format!(
                    "fused Clip has min {min} above max {max}"
                )));
            }
            Ok(Activation::Clip { min, max })
        }
        FuseOp::LeakyRelu { alpha } => Ok(Activation::LeakyRelu { alpha }),
        FuseOp::PRelu { slope_input } => {
            let slope = ctx.input(slope_input)?;
            let count = slope.shape().element_count();
            if count != 1 && count != output.dim(1) {
                return Err(Error::Shape(format!(
                    "fused PRelu slope {} has {count} values for {} channels",
                    slope.name(),
                    output.dim(1)
                )));
            }
            Ok(Activation::PRelu {
                slope_addr: slope.buffer_addr(),
            })
        }
        FuseOp::Add { .. } => Err(Error::InvalidConfig(
            "Add is not an activation".to_string(),
        )),
    }
}

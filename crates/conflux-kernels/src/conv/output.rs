//! Output buffer binding with concat fusion groups.

use super::config::FuseInfo;
use conflux_core::{DeviceContext, Error, Result, Tensor, TensorShape};
use tracing::{debug, error};

/// Shape of the shared buffer for a concat group of `total_channels`
/// channels that `output` is a member of.
///
/// The channel dim is padded up to the output format's channel alignment.
pub fn fusion_shape(output: &TensorShape, total_channels: usize) -> TensorShape {
    let mut shape = output.clone();
    shape.set_dim(1, total_channels);
    shape.calc_padding();
    shape
}

/// Bind a buffer to every output tensor.
///
/// Outputs outside a concat group get their own buffer, reused across
/// invocations while it is large enough. Members of a group share the one
/// buffer the context holds for the group id, allocated by whichever member
/// gets here first.
pub fn bind_outputs(ctx: &DeviceContext, fuse: &FuseInfo, outputs: &mut [Tensor]) -> Result<()> {
    let device = ctx.device().as_ref();

    for output in outputs.iter_mut() {
        if !fuse.joins_concat() {
            output.realloc_buffer(device).map_err(|source| {
                error!(tensor = output.name(), %source, "output allocation failed");
                Error::TensorAllocation {
                    tensor: output.name().to_string(),
                    source: Box::new(source),
                }
            })?;
            continue;
        }

        let group = fuse.concat_edge_id;
        let shape = fusion_shape(output.shape(), fuse.channel_size);
        let (buffer, allocated) = ctx.fusion_buffer_or_alloc(group, &shape).map_err(|source| {
            error!(tensor = output.name(), group, %source, "fusion buffer binding failed");
            Error::TensorAllocation {
                tensor: output.name().to_string(),
                source: Box::new(source),
            }
        })?;
        if allocated {
            debug!(group, shape = %shape, bytes = buffer.size, "allocated fusion buffer");
        }
        output.bind_shared(device, buffer, group);
    }

    Ok(())
}

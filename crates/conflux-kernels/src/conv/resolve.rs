//! Shape inference and parameter resolution for convolution.
//!
//! Pure functions of the operand shapes and static configuration.

use super::config::ConvConfig;
use conflux_core::types::align_up;
use conflux_core::{ConvParams, Error, Result, TensorShape};

fn check_rank(shape: &TensorShape, role: &str) -> Result<()> {
    if shape.rank() != 4 {
        return Err(Error::Shape(format!(
            "Conv {role} must be 4D [N, C, H, W], got {:?}",
            shape.dims()
        )));
    }
    Ok(())
}

fn check_channels(input: &TensorShape, weight: &TensorShape, group: usize) -> Result<()> {
    let num_chl = input.dim(1);
    let num_flt = weight.dim(0);
    if weight.dim(1) * group != num_chl {
        return Err(Error::Shape(format!(
            "Conv weight {:?} with group {group} does not match input channels {num_chl}",
            weight.dims()
        )));
    }
    if num_flt % group != 0 {
        return Err(Error::Shape(format!(
            "Conv filter count {num_flt} is not divisible by group {group}"
        )));
    }
    Ok(())
}

/// Output extent of one spatial axis (0 = height, 1 = width).
fn output_extent(input: &TensorShape, weight: &TensorShape, config: &ConvConfig, axis: usize) -> Result<usize> {
    let in_size = input.dim(2 + axis);
    let kernel = weight.dim(2 + axis);
    let extent = config.dilations[axis] * (kernel.max(1) - 1) + 1;
    let padded = in_size + config.pads[axis] + config.pads[axis + 2];
    if padded < extent {
        return Err(Error::Shape(format!(
            "Conv kernel extent {extent} exceeds padded input {padded} on axis {}",
            2 + axis
        )));
    }
    Ok((padded - extent) / config.strides[axis] + 1)
}

/// Compute the output shape from the input and weight shapes.
///
/// The output inherits the input's element type and layout.
pub fn infer_output_shape(
    input: &TensorShape,
    weight: &TensorShape,
    config: &ConvConfig,
) -> Result<TensorShape> {
    check_rank(input, "input")?;
    check_rank(weight, "weight")?;
    if let Some(kernel_shape) = config.kernel_shape {
        if kernel_shape != [weight.dim(2), weight.dim(3)] {
            return Err(Error::Shape(format!(
                "Conv kernel_shape {kernel_shape:?} does not match weight {:?}",
                weight.dims()
            )));
        }
    }
    check_channels(input, weight, config.group)?;

    let out_height = output_extent(input, weight, config, 0)?;
    let out_width = output_extent(input, weight, config, 1)?;
    let mut output = TensorShape::new(
        &[input.dim(0), weight.dim(0), out_height, out_width],
        input.dtype(),
        input.format(),
    );
    output.calc_padding();
    Ok(output)
}

/// Resolve the geometry the workspace query and the primitive consume.
///
/// Fails with [`Error::Shape`] when the operands are structurally
/// incompatible, including an output shape that disagrees with the input
/// and weight.
pub fn resolve_conv_params(
    input: &TensorShape,
    weight: &TensorShape,
    output: &TensorShape,
    config: &ConvConfig,
) -> Result<ConvParams> {
    let expected = infer_output_shape(input, weight, config)?;
    if output.dims() != expected.dims() {
        return Err(Error::Shape(format!(
            "Conv output {:?} does not match inferred {:?}",
            output.dims(),
            expected.dims()
        )));
    }

    let group = config.group;
    let align = input.format().channel_alignment();
    let num_chl = input.dim(1);
    let num_flt = weight.dim(0);

    Ok(ConvParams {
        in_num: input.dim(0),
        num_chl,
        num_chl_pad: align_up(num_chl / group, align) * group,
        in_height: input.dim(2),
        in_width: input.dim(3),
        num_flt,
        num_flt_pad: align_up(num_flt / group, align) * group,
        flt_height: weight.dim(2),
        flt_width: weight.dim(3),
        out_height: expected.dim(2),
        out_width: expected.dim(3),
        stride_height: config.strides[0],
        stride_width: config.strides[1],
        pad_height: config.pads[0],
        pad_width: config.pads[1],
        hole_height: config.dilations[0],
        hole_width: config.dilations[1],
        num_grp: group,
    })
}
